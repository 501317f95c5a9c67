//! The objects admission requests carry.
use k8s_openapi::{
    api::{
        apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet},
        batch::v1::{CronJob, Job},
        core::v1::{Pod, PodSpec, PodTemplateSpec},
    },
    apimachinery::pkg::apis::meta::v1::{ListMeta, ObjectMeta},
};
use kube::api::{DynamicObject, TypeMeta};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::INJECT_ANNOTATION;

pub type Result<T, E = TargetError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum TargetError {
    #[snafu(display("the object has no {field}"))]
    MissingTypeMeta { field: &'static str },

    #[snafu(display("failed to decode object of kind {kind:?}"))]
    DecodeObject {
        source: serde_json::Error,
        kind: String,
    },

    #[snafu(display("failed to encode object of kind {kind:?}"))]
    EncodeObject {
        source: serde_json::Error,
        kind: String,
    },
}

/// A heterogeneous `v1/List`, whose items are kept in their raw form.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ObjectList {
    #[serde(flatten)]
    pub types: TypeMeta,

    #[serde(default)]
    pub metadata: ListMeta,

    #[serde(default)]
    pub items: Vec<Value>,
}

/// An object which may receive a fuse sidecar.
///
/// Well-known workload kinds are decoded into their typed representation,
/// lists keep their raw items and every other kind is handled as
/// [`DynamicObject`].
#[derive(Clone, Debug, PartialEq)]
pub enum TargetObject {
    Pod(Pod),
    Deployment(Deployment),
    StatefulSet(StatefulSet),
    DaemonSet(DaemonSet),
    ReplicaSet(ReplicaSet),
    Job(Job),
    CronJob(CronJob),
    List(ObjectList),
    Dynamic(DynamicObject),
}

impl TargetObject {
    /// Decodes `value`, falling back to [`TargetObject::Dynamic`] for kinds
    /// which are not well-known.
    pub fn from_value(value: Value) -> Result<Self> {
        let (_, kind) = type_meta(&value)?;

        match Self::from_known_value(value.clone())? {
            Some(object) => Ok(object),
            None => serde_json::from_value(value)
                .map(Self::Dynamic)
                .context(DecodeObjectSnafu { kind }),
        }
    }

    /// Decodes `value` if its kind is well-known, returns [`None`] otherwise.
    pub fn from_known_value(value: Value) -> Result<Option<Self>> {
        let (api_version, kind) = type_meta(&value)?;

        let object = match (api_version.as_str(), kind.as_str()) {
            ("v1", "Pod") => serde_json::from_value(value).map(Self::Pod),
            ("v1", "List") => serde_json::from_value(value).map(Self::List),
            ("apps/v1", "Deployment") => serde_json::from_value(value).map(Self::Deployment),
            ("apps/v1", "StatefulSet") => serde_json::from_value(value).map(Self::StatefulSet),
            ("apps/v1", "DaemonSet") => serde_json::from_value(value).map(Self::DaemonSet),
            ("apps/v1", "ReplicaSet") => serde_json::from_value(value).map(Self::ReplicaSet),
            ("batch/v1", "Job") => serde_json::from_value(value).map(Self::Job),
            ("batch/v1", "CronJob") => serde_json::from_value(value).map(Self::CronJob),
            _ => return Ok(None),
        };

        object.map(Some).context(DecodeObjectSnafu { kind })
    }

    pub fn to_value(&self) -> Result<Value> {
        let value = match self {
            Self::Pod(object) => serde_json::to_value(object),
            Self::Deployment(object) => serde_json::to_value(object),
            Self::StatefulSet(object) => serde_json::to_value(object),
            Self::DaemonSet(object) => serde_json::to_value(object),
            Self::ReplicaSet(object) => serde_json::to_value(object),
            Self::Job(object) => serde_json::to_value(object),
            Self::CronJob(object) => serde_json::to_value(object),
            Self::List(object) => serde_json::to_value(object),
            Self::Dynamic(object) => serde_json::to_value(object),
        };

        value.with_context(|_| EncodeObjectSnafu { kind: self.kind() })
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Pod(_) => "Pod",
            Self::Deployment(_) => "Deployment",
            Self::StatefulSet(_) => "StatefulSet",
            Self::DaemonSet(_) => "DaemonSet",
            Self::ReplicaSet(_) => "ReplicaSet",
            Self::Job(_) => "Job",
            Self::CronJob(_) => "CronJob",
            Self::List(list) => &list.types.kind,
            Self::Dynamic(object) => object
                .types
                .as_ref()
                .map_or("", |types| types.kind.as_str()),
        }
    }

    /// Returns the object metadata. Lists have none.
    pub fn metadata(&self) -> Option<&ObjectMeta> {
        match self {
            Self::Pod(object) => Some(&object.metadata),
            Self::Deployment(object) => Some(&object.metadata),
            Self::StatefulSet(object) => Some(&object.metadata),
            Self::DaemonSet(object) => Some(&object.metadata),
            Self::ReplicaSet(object) => Some(&object.metadata),
            Self::Job(object) => Some(&object.metadata),
            Self::CronJob(object) => Some(&object.metadata),
            Self::List(_) => None,
            Self::Dynamic(object) => Some(&object.metadata),
        }
    }

    pub fn metadata_mut(&mut self) -> Option<&mut ObjectMeta> {
        match self {
            Self::Pod(object) => Some(&mut object.metadata),
            Self::Deployment(object) => Some(&mut object.metadata),
            Self::StatefulSet(object) => Some(&mut object.metadata),
            Self::DaemonSet(object) => Some(&mut object.metadata),
            Self::ReplicaSet(object) => Some(&mut object.metadata),
            Self::Job(object) => Some(&mut object.metadata),
            Self::CronJob(object) => Some(&mut object.metadata),
            Self::List(_) => None,
            Self::Dynamic(object) => Some(&mut object.metadata),
        }
    }

    /// Returns the value of the label `key`, if present.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata()?.labels.as_ref()?.get(key).map(String::as_str)
    }

    /// Returns whether the [`INJECT_ANNOTATION`] activates injection, either on
    /// the object itself or on its pod template.
    ///
    /// A list is activated if any of its items is. Items which fail to decode
    /// count as activated, so decoding errors surface during injection.
    pub fn injection_activated(&self) -> bool {
        match self {
            Self::List(list) => list.items.iter().any(|item| {
                match Self::from_known_value(item.clone()) {
                    Ok(Some(object)) => object.injection_activated(),
                    Ok(None) => false,
                    Err(_) => true,
                }
            }),
            _ => {
                is_activated(self.metadata())
                    || is_activated(self.pod_template().and_then(|template| template.metadata.as_ref()))
            }
        }
    }

    /// Returns the metadata which belongs to the pod spec: the object metadata
    /// of pods and untyped objects, the pod template metadata otherwise.
    pub(crate) fn pod_metadata(&self) -> Option<&ObjectMeta> {
        match self {
            Self::Pod(_) | Self::Dynamic(_) => self.metadata(),
            Self::List(_) => None,
            _ => self.pod_template()?.metadata.as_ref(),
        }
    }

    pub(crate) fn pod_metadata_mut(&mut self) -> Option<&mut ObjectMeta> {
        let template = match self {
            Self::Pod(object) => return Some(&mut object.metadata),
            Self::Dynamic(object) => return Some(&mut object.metadata),
            Self::List(_) => return None,
            Self::Deployment(object) => object.spec.as_mut().map(|spec| &mut spec.template),
            Self::StatefulSet(object) => object.spec.as_mut().map(|spec| &mut spec.template),
            Self::DaemonSet(object) => object.spec.as_mut().map(|spec| &mut spec.template),
            Self::ReplicaSet(object) => object.spec.as_mut().and_then(|spec| spec.template.as_mut()),
            Self::Job(object) => object.spec.as_mut().map(|spec| &mut spec.template),
            Self::CronJob(object) => object
                .spec
                .as_mut()
                .and_then(|spec| spec.job_template.spec.as_mut())
                .map(|spec| &mut spec.template),
        };

        Some(template?.metadata.get_or_insert_default())
    }

    /// Returns the pod template of template-bearing kinds.
    pub(crate) fn pod_template(&self) -> Option<&PodTemplateSpec> {
        match self {
            Self::Deployment(object) => object.spec.as_ref().map(|spec| &spec.template),
            Self::StatefulSet(object) => object.spec.as_ref().map(|spec| &spec.template),
            Self::DaemonSet(object) => object.spec.as_ref().map(|spec| &spec.template),
            Self::ReplicaSet(object) => object.spec.as_ref()?.template.as_ref(),
            Self::Job(object) => object.spec.as_ref().map(|spec| &spec.template),
            Self::CronJob(object) => object
                .spec
                .as_ref()?
                .job_template
                .spec
                .as_ref()
                .map(|spec| &spec.template),
            Self::Pod(_) | Self::List(_) | Self::Dynamic(_) => None,
        }
    }

    /// Returns the typed pod spec of well-known kinds.
    pub(crate) fn pod_spec(&self) -> Option<&PodSpec> {
        match self {
            Self::Pod(object) => object.spec.as_ref(),
            _ => self.pod_template()?.spec.as_ref(),
        }
    }

    pub(crate) fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        let template = match self {
            Self::Pod(object) => return object.spec.as_mut(),
            Self::Deployment(object) => object.spec.as_mut().map(|spec| &mut spec.template),
            Self::StatefulSet(object) => object.spec.as_mut().map(|spec| &mut spec.template),
            Self::DaemonSet(object) => object.spec.as_mut().map(|spec| &mut spec.template),
            Self::ReplicaSet(object) => object.spec.as_mut().and_then(|spec| spec.template.as_mut()),
            Self::Job(object) => object.spec.as_mut().map(|spec| &mut spec.template),
            Self::CronJob(object) => object
                .spec
                .as_mut()
                .and_then(|spec| spec.job_template.spec.as_mut())
                .map(|spec| &mut spec.template),
            Self::List(_) | Self::Dynamic(_) => None,
        };

        template?.spec.as_mut()
    }
}

fn is_activated(metadata: Option<&ObjectMeta>) -> bool {
    metadata
        .and_then(|metadata| metadata.annotations.as_ref())
        .and_then(|annotations| annotations.get(INJECT_ANNOTATION))
        .is_some_and(|value| value == "true")
}

fn type_meta(value: &Value) -> Result<(String, String)> {
    let api_version = value
        .get("apiVersion")
        .and_then(Value::as_str)
        .context(MissingTypeMetaSnafu {
            field: "apiVersion",
        })?;
    let kind = value
        .get("kind")
        .and_then(Value::as_str)
        .context(MissingTypeMetaSnafu { field: "kind" })?;

    Ok((api_version.to_owned(), kind.to_owned()))
}
