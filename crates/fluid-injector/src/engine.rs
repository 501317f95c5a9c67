use k8s_openapi::{
    api::core::v1::{Container, PodSpec, Volume},
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::api::DynamicObject;
use serde_json::{Map, Value};
use snafu::{ResultExt, Snafu};
use tracing::{debug, info, instrument};

use crate::{
    FUSE_CONTAINER_NAME, INJECT_SIDECAR_DONE_LABEL, InjectionTemplate,
    resolver::{ObjectFieldResolver, PodSpecFields, ResolveError, ResolveOptions},
    target::{ObjectList, TargetError, TargetObject},
};

/// Mount propagation of application mounts backed by a dataset, so they see
/// the fuse mount which appears after the containers started.
pub const HOST_TO_CONTAINER: &str = "HostToContainer";

const INIT_CONTAINERS_FIELD: &str = "initContainers";

pub type Result<T, E = InjectError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum InjectError {
    #[snafu(display("failed to decode list item {index}"))]
    DecodeListItem { source: TargetError, index: usize },

    #[snafu(display("failed to encode list item {index}"))]
    EncodeListItem { source: TargetError, index: usize },

    #[snafu(display("failed to resolve the pod spec fields of kind {kind:?}"))]
    ResolveFields { source: ResolveError, kind: String },

    #[snafu(display("failed to encode the injection template"))]
    EncodeTemplate { source: serde_json::Error },

    #[snafu(display("the field {field:?} at {pointer:?} is not a list"))]
    NotAList { field: String, pointer: String },
}

/// Injects the fuse sidecars described by [`InjectionTemplate`]s.
///
/// Injection never touches its input, it returns a mutated copy. Objects
/// without the [`INJECT_ANNOTATION`](crate::INJECT_ANNOTATION), objects
/// labeled with [`INJECT_SIDECAR_DONE_LABEL`] and objects which already run a
/// fuse container are returned unchanged, which makes injection idempotent.
/// Injected pod specs receive the [`INJECT_SIDECAR_DONE_LABEL`].
#[derive(Clone, Debug, Default)]
pub struct InjectionEngine {
    options: ResolveOptions,
}

impl InjectionEngine {
    pub fn new(options: ResolveOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ResolveOptions {
        &self.options
    }

    /// Injects the sidecar of a single dataset.
    pub fn inject(
        &self,
        target: &TargetObject,
        template: &InjectionTemplate,
    ) -> Result<TargetObject> {
        self.inject_all(target, std::slice::from_ref(template))
    }

    /// Injects one sidecar per template. With more than one template, the
    /// sidecar of the template at index `i` and its added volumes are named
    /// with the suffix `-{i}`.
    #[instrument(
        name = "inject_fuse_sidecars",
        skip_all,
        fields(target.kind = target.kind(), templates = templates.len())
    )]
    pub fn inject_all(
        &self,
        target: &TargetObject,
        templates: &[InjectionTemplate],
    ) -> Result<TargetObject> {
        let mut out = target.clone();
        if templates.is_empty() {
            return Ok(out);
        }

        let templates: Vec<InjectionTemplate> = if templates.len() == 1 {
            templates.to_vec()
        } else {
            templates
                .iter()
                .enumerate()
                .map(|(index, template)| template.with_name_suffix(&format!("-{index}")))
                .collect()
        };

        self.inject_object(&mut out, &templates)?;
        Ok(out)
    }

    /// Returns the names of all persistent volume claims the pod specs of
    /// `target` reference, without duplicates.
    pub fn claim_names(&self, target: &TargetObject) -> Result<Vec<String>> {
        let mut claim_names: Vec<String> = Vec::new();
        for ClaimVolume { claim_name, .. } in self.claim_volumes(target)? {
            if !claim_names.contains(&claim_name) {
                claim_names.push(claim_name);
            }
        }

        Ok(claim_names)
    }

    /// Returns every volume of `target` which is backed by a persistent
    /// volume claim, in document order.
    pub fn claim_volumes(&self, target: &TargetObject) -> Result<Vec<ClaimVolume>> {
        let mut claim_volumes = Vec::new();
        self.collect_claim_volumes(target, &mut claim_volumes)?;

        Ok(claim_volumes)
    }

    fn inject_object(&self, target: &mut TargetObject, templates: &[InjectionTemplate]) -> Result<()> {
        if let TargetObject::List(list) = &mut *target {
            return self.inject_list(list, templates);
        }

        if !target.injection_activated() {
            debug!("injection is not activated, skipping");
            return Ok(());
        }
        if is_done(target.pod_metadata()) {
            debug!("pod spec is already injected, skipping");
            return Ok(());
        }

        let injected = match &mut *target {
            TargetObject::Dynamic(object) => self.inject_dynamic(object, templates)?,
            known => match known.pod_spec_mut() {
                Some(pod_spec) => apply(pod_spec, templates)?,
                None => {
                    debug!("object has no pod spec, skipping");
                    false
                }
            },
        };

        if injected {
            if let Some(metadata) = target.pod_metadata_mut() {
                mark_done(metadata);
            }
        }

        Ok(())
    }

    fn inject_list(&self, list: &mut ObjectList, templates: &[InjectionTemplate]) -> Result<()> {
        for (index, item) in list.items.iter_mut().enumerate() {
            let Some(mut object) =
                TargetObject::from_known_value(item.clone()).context(DecodeListItemSnafu { index })?
            else {
                debug!(list.index = index, "skipping list item of unknown kind");
                continue;
            };

            self.inject_object(&mut object, templates)?;
            *item = object.to_value().context(EncodeListItemSnafu { index })?;
        }

        Ok(())
    }

    /// Injects every pod spec found in `object`. Returns whether any of them
    /// was injected.
    fn inject_dynamic(&self, object: &mut DynamicObject, templates: &[InjectionTemplate]) -> Result<bool> {
        let pod_specs = ObjectFieldResolver::new(&self.options)
            .resolve(&object.data)
            .with_context(|_| ResolveFieldsSnafu {
                kind: dynamic_kind(object),
            })?;

        let mut injected = false;
        for fields in &pod_specs {
            if let Some(Value::Object(pod_spec)) = object.data.pointer_mut(&fields.pointer) {
                injected |= apply(
                    &mut JsonPodSpec {
                        object: pod_spec,
                        fields,
                    },
                    templates,
                )?;
            }
        }

        Ok(injected)
    }

    fn collect_claim_volumes(&self, target: &TargetObject, claim_volumes: &mut Vec<ClaimVolume>) -> Result<()> {
        match target {
            TargetObject::List(list) => {
                for (index, item) in list.items.iter().enumerate() {
                    if let Some(object) = TargetObject::from_known_value(item.clone())
                        .context(DecodeListItemSnafu { index })?
                    {
                        self.collect_claim_volumes(&object, claim_volumes)?;
                    }
                }
            }
            TargetObject::Dynamic(object) => {
                let pod_specs = match ObjectFieldResolver::new(&self.options).resolve(&object.data) {
                    Ok(pod_specs) => pod_specs,
                    Err(ResolveError::NoPodSpec) => return Ok(()),
                    Err(source) => {
                        return Err(InjectError::ResolveFields {
                            source,
                            kind: dynamic_kind(object),
                        });
                    }
                };

                for fields in pod_specs {
                    let volumes = object
                        .data
                        .pointer(&fields.pointer)
                        .and_then(|pod_spec| pod_spec.get(&fields.volumes))
                        .and_then(Value::as_array);

                    claim_volumes.extend(volumes.into_iter().flatten().filter_map(|volume| {
                        Some(ClaimVolume {
                            volume_name: volume.get("name")?.as_str()?.to_owned(),
                            claim_name: volume
                                .pointer("/persistentVolumeClaim/claimName")?
                                .as_str()?
                                .to_owned(),
                        })
                    }));
                }
            }
            known => {
                let volumes = known.pod_spec().and_then(|pod_spec| pod_spec.volumes.as_ref());
                claim_volumes.extend(volumes.into_iter().flatten().filter_map(|volume| {
                    Some(ClaimVolume {
                        volume_name: volume.name.clone(),
                        claim_name: volume.persistent_volume_claim.as_ref()?.claim_name.clone(),
                    })
                }));
            }
        }

        Ok(())
    }
}

/// A pod volume backed by a persistent volume claim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimVolume {
    pub volume_name: String,
    pub claim_name: String,
}

/// Uniform access to typed and untyped pod specs.
trait PodSpecAccess {
    fn container_names(&self) -> Vec<String>;

    /// Replaces the volume named like `volume`, returns `false` if there is
    /// none.
    fn update_volume(&mut self, volume: &Volume) -> Result<bool>;

    fn add_volume(&mut self, volume: &Volume) -> Result<()>;

    fn prepend_container(&mut self, container: &Container) -> Result<()>;

    /// Sets [`HOST_TO_CONTAINER`] propagation on every container and init
    /// container mount of `volume_names`.
    fn propagate_host_mounts(&mut self, volume_names: &[&str]);
}

impl PodSpecAccess for PodSpec {
    fn container_names(&self) -> Vec<String> {
        self.containers
            .iter()
            .map(|container| container.name.clone())
            .collect()
    }

    fn update_volume(&mut self, volume: &Volume) -> Result<bool> {
        let existing = self
            .volumes
            .iter_mut()
            .flatten()
            .find(|existing| existing.name == volume.name);

        Ok(match existing {
            Some(existing) => {
                *existing = volume.clone();
                true
            }
            None => false,
        })
    }

    fn add_volume(&mut self, volume: &Volume) -> Result<()> {
        self.volumes.get_or_insert_with(Vec::new).push(volume.clone());
        Ok(())
    }

    fn prepend_container(&mut self, container: &Container) -> Result<()> {
        self.containers.insert(0, container.clone());
        Ok(())
    }

    fn propagate_host_mounts(&mut self, volume_names: &[&str]) {
        let containers = self
            .containers
            .iter_mut()
            .chain(self.init_containers.iter_mut().flatten());

        for mount in containers.flat_map(|container| container.volume_mounts.iter_mut().flatten()) {
            if volume_names.contains(&mount.name.as_str()) {
                mount.mount_propagation = Some(HOST_TO_CONTAINER.to_owned());
            }
        }
    }
}

struct JsonPodSpec<'a> {
    object: &'a mut Map<String, Value>,
    fields: &'a PodSpecFields,
}

impl JsonPodSpec<'_> {
    fn list_mut(&mut self, field: &str) -> Result<&mut Vec<Value>> {
        let pointer = &self.fields.pointer;
        match self
            .object
            .entry(field)
            .or_insert_with(|| Value::Array(Vec::new()))
        {
            Value::Array(items) => Ok(items),
            _ => NotAListSnafu { field, pointer }.fail(),
        }
    }
}

impl PodSpecAccess for JsonPodSpec<'_> {
    fn container_names(&self) -> Vec<String> {
        self.object
            .get(&self.fields.containers)
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|container| container.get("name")?.as_str().map(ToOwned::to_owned))
            .collect()
    }

    fn update_volume(&mut self, volume: &Volume) -> Result<bool> {
        let Some(Value::Array(volumes)) = self.object.get_mut(&self.fields.volumes) else {
            return Ok(false);
        };

        let existing = volumes
            .iter_mut()
            .find(|existing| existing.get("name").and_then(Value::as_str) == Some(volume.name.as_str()));

        match existing {
            Some(existing) => {
                *existing = serde_json::to_value(volume).context(EncodeTemplateSnafu)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn add_volume(&mut self, volume: &Volume) -> Result<()> {
        let volume = serde_json::to_value(volume).context(EncodeTemplateSnafu)?;
        let field = self.fields.volumes.clone();
        self.list_mut(&field)?.push(volume);

        Ok(())
    }

    fn prepend_container(&mut self, container: &Container) -> Result<()> {
        let container = serde_json::to_value(container).context(EncodeTemplateSnafu)?;
        let field = self.fields.containers.clone();
        self.list_mut(&field)?.insert(0, container);

        Ok(())
    }

    fn propagate_host_mounts(&mut self, volume_names: &[&str]) {
        let fields: &PodSpecFields = self.fields;

        for field in [fields.containers.as_str(), INIT_CONTAINERS_FIELD] {
            let Some(Value::Array(containers)) = self.object.get_mut(field) else {
                continue;
            };

            let mounts = containers
                .iter_mut()
                .filter_map(|container| container.get_mut("volumeMounts")?.as_array_mut())
                .flatten()
                .filter_map(Value::as_object_mut);
            for mount in mounts {
                let backed_by_dataset = mount
                    .get("name")
                    .and_then(Value::as_str)
                    .is_some_and(|name| volume_names.contains(&name));
                if backed_by_dataset {
                    mount.insert("mountPropagation".to_owned(), Value::from(HOST_TO_CONTAINER));
                }
            }
        }
    }
}

/// Runs the mutation steps of every template on a single pod spec. Returns
/// `false` if the pod spec already runs a fuse container.
fn apply(pod_spec: &mut impl PodSpecAccess, templates: &[InjectionTemplate]) -> Result<bool> {
    let injected = pod_spec.container_names().into_iter().find(|name| {
        name.starts_with(FUSE_CONTAINER_NAME)
            || templates
                .iter()
                .any(|template| template.fuse_container().name == *name)
    });
    if let Some(container_name) = injected {
        info!(
            container.name = %container_name,
            "found existing fuse container, skipping injection"
        );
        return Ok(false);
    }

    for template in templates {
        let mut updated_volumes = Vec::new();
        for volume in template.volumes_to_update() {
            if pod_spec.update_volume(volume)? {
                updated_volumes.push(volume.name.as_str());
            } else {
                debug!(volume.name = %volume.name, "no volume to update");
            }
        }
        pod_spec.propagate_host_mounts(&updated_volumes);

        for volume in template.volumes_to_add() {
            pod_spec.add_volume(volume)?;
        }

        let fuse_container = template.fuse_container();
        pod_spec.prepend_container(fuse_container)?;
        debug!(container.name = %fuse_container.name, "injected fuse container");
    }

    Ok(true)
}

fn is_done(metadata: Option<&ObjectMeta>) -> bool {
    metadata
        .and_then(|metadata| metadata.labels.as_ref())
        .and_then(|labels| labels.get(INJECT_SIDECAR_DONE_LABEL))
        .is_some_and(|value| value == "true")
}

fn mark_done(metadata: &mut ObjectMeta) {
    metadata
        .labels
        .get_or_insert_default()
        .insert(INJECT_SIDECAR_DONE_LABEL.to_owned(), "true".to_owned());
}

fn dynamic_kind(object: &DynamicObject) -> String {
    object
        .types
        .as_ref()
        .map(|types| types.kind.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::HostPathVolumeSource;
    use serde_json::json;

    use super::*;
    use crate::INJECT_ANNOTATION;

    fn template() -> InjectionTemplate {
        InjectionTemplate::builder()
            .fuse_container(Container {
                name: "fuse".to_owned(),
                image: Some("fluid/fuse".to_owned()),
                ..Container::default()
            })
            .volumes_to_add(vec![host_path_volume("fuse-device", "/dev/fuse")])
            .volumes_to_update(vec![host_path_volume("dataset1", "/runtime-mnt/default/dataset1")])
            .build()
    }

    fn host_path_volume(name: &str, path: &str) -> Volume {
        Volume {
            name: name.to_owned(),
            host_path: Some(HostPathVolumeSource {
                path: path.to_owned(),
                ..HostPathVolumeSource::default()
            }),
            ..Volume::default()
        }
    }

    fn pod(annotations: Value) -> TargetObject {
        TargetObject::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "app", "namespace": "default", "annotations": annotations},
            "spec": {
                "containers": [{"name": "app", "image": "nginx"}],
                "volumes": [{"name": "dataset1", "persistentVolumeClaim": {"claimName": "dataset1"}}]
            }
        }))
        .unwrap()
    }

    fn activated_pod() -> TargetObject {
        pod(json!({INJECT_ANNOTATION: "true"}))
    }

    fn container_names(object: &TargetObject) -> Vec<String> {
        object.pod_spec().unwrap().container_names()
    }

    fn volume_names(object: &TargetObject) -> Vec<String> {
        object
            .pod_spec()
            .unwrap()
            .volumes
            .iter()
            .flatten()
            .map(|volume| volume.name.clone())
            .collect()
    }

    #[test]
    fn injects_sidecar_into_pod() {
        let out = InjectionEngine::default()
            .inject(&activated_pod(), &template())
            .unwrap();

        assert_eq!(container_names(&out), ["fuse", "app"]);
        assert_eq!(volume_names(&out), ["dataset1", "fuse-device"]);

        let dataset_volume = &out.pod_spec().unwrap().volumes.as_ref().unwrap()[0];
        assert!(dataset_volume.persistent_volume_claim.is_none());
        assert_eq!(
            dataset_volume.host_path.as_ref().unwrap().path,
            "/runtime-mnt/default/dataset1"
        );
    }

    #[test]
    fn injection_is_idempotent() {
        let engine = InjectionEngine::default();

        let once = engine.inject(&activated_pod(), &template()).unwrap();
        let twice = engine.inject(&once, &template()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn input_is_never_mutated() {
        let input = activated_pod();
        let snapshot = input.clone();

        InjectionEngine::default().inject(&input, &template()).unwrap();
        assert_eq!(input, snapshot);
    }

    #[test]
    fn missing_annotation_leaves_object_unchanged() {
        let input = pod(json!({}));

        let out = InjectionEngine::default().inject(&input, &template()).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn fuse_container_variants_count_as_injected() {
        let input = TargetObject::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "app", "annotations": {INJECT_ANNOTATION: "true"}},
            "spec": {"containers": [
                {"name": "fluid-fuse-0", "image": "fluid/fuse"},
                {"name": "fluid-fuse-1", "image": "fluid/fuse"},
                {"name": "app", "image": "nginx"}
            ]}
        }))
        .unwrap();

        let out = InjectionEngine::default().inject(&input, &template()).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn pod_without_containers_receives_sidecar() {
        let input = TargetObject::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "app", "annotations": {INJECT_ANNOTATION: "true"}},
            "spec": {"containers": []}
        }))
        .unwrap();

        let out = InjectionEngine::default().inject(&input, &template()).unwrap();
        assert_eq!(container_names(&out), ["fuse"]);
        assert_eq!(volume_names(&out), ["fuse-device"]);
    }

    #[test]
    fn deployment_activated_by_pod_template() {
        let input = TargetObject::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web"},
            "spec": {
                "selector": {"matchLabels": {"app": "web"}},
                "template": {
                    "metadata": {"annotations": {INJECT_ANNOTATION: "true"}},
                    "spec": {"containers": [{"name": "web", "image": "nginx"}]}
                }
            }
        }))
        .unwrap();

        let out = InjectionEngine::default().inject(&input, &template()).unwrap();
        assert_eq!(container_names(&out), ["fuse", "web"]);
    }

    fn tf_job() -> TargetObject {
        TargetObject::from_value(json!({
            "apiVersion": "kubeflow.org/v1",
            "kind": "TFJob",
            "metadata": {"name": "mnist", "annotations": {INJECT_ANNOTATION: "true"}},
            "spec": {"tfReplicaSpecs": {
                "PS": {"template": {"spec": {
                    "containers": [{
                        "name": "tensorflow",
                        "image": "tf",
                        "volumeMounts": [{"name": "dataset1", "mountPath": "/data"}]
                    }],
                    "volumes": [{"name": "dataset1", "persistentVolumeClaim": {"claimName": "dataset1"}}]
                }}},
                "Worker": {"template": {"spec": {
                    "initContainers": [{"name": "prepare", "image": "busybox"}],
                    "containers": [{"name": "tensorflow", "image": "tf"}]
                }}}
            }}
        }))
        .unwrap()
    }

    #[test]
    fn injects_every_pod_spec_of_unknown_kinds() {
        let out = InjectionEngine::default().inject(&tf_job(), &template()).unwrap();
        let TargetObject::Dynamic(object) = out else {
            panic!("TFJob must stay dynamic");
        };

        let names = |pointer: &str| -> Vec<&str> {
            object.data.pointer(pointer).unwrap().as_array().unwrap().iter()
                .map(|item| item["name"].as_str().unwrap())
                .collect()
        };
        assert_eq!(names("/spec/tfReplicaSpecs/PS/template/spec/containers"), ["fuse", "tensorflow"]);
        assert_eq!(names("/spec/tfReplicaSpecs/PS/template/spec/volumes"), ["dataset1", "fuse-device"]);
        assert_eq!(names("/spec/tfReplicaSpecs/Worker/template/spec/containers"), ["fuse", "tensorflow"]);
        assert_eq!(names("/spec/tfReplicaSpecs/Worker/template/spec/initContainers"), ["prepare"]);
        assert_eq!(names("/spec/tfReplicaSpecs/Worker/template/spec/volumes"), ["fuse-device"]);
        assert_eq!(
            object.data.pointer("/spec/tfReplicaSpecs/PS/template/spec/volumes/0/hostPath/path"),
            Some(&json!("/runtime-mnt/default/dataset1"))
        );
        assert_eq!(
            object
                .data
                .pointer("/spec/tfReplicaSpecs/PS/template/spec/containers/1/volumeMounts/0/mountPropagation"),
            Some(&json!(HOST_TO_CONTAINER))
        );
        assert_eq!(
            object.metadata.labels.unwrap().get(INJECT_SIDECAR_DONE_LABEL).map(String::as_str),
            Some("true")
        );
    }

    #[test]
    fn unknown_kind_injection_is_idempotent() {
        let engine = InjectionEngine::default();

        let once = engine.inject(&tf_job(), &template()).unwrap();
        let twice = engine.inject(&once, &template()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn ambiguous_unknown_kind_is_rejected() {
        let input = TargetObject::from_value(json!({
            "apiVersion": "example.com/v1",
            "kind": "Sidecarred",
            "metadata": {"name": "x", "annotations": {INJECT_ANNOTATION: "true"}},
            "spec": {
                "containers": [{"name": "app", "image": "nginx"}],
                "helpers": [{"name": "proxy", "image": "envoy"}]
            }
        }))
        .unwrap();

        let err = InjectionEngine::default().inject(&input, &template()).unwrap_err();
        assert!(matches!(
            err,
            InjectError::ResolveFields {
                source: ResolveError::AmbiguousField { .. },
                ..
            }
        ));
    }

    #[test]
    fn lists_skip_unknown_kinds() {
        let foreign = json!({"apiVersion": "kubeflow.org/v1", "kind": "TFJob", "metadata": {"name": "mnist"}});
        let input = TargetObject::from_value(json!({
            "apiVersion": "v1",
            "kind": "List",
            "items": [activated_pod().to_value().unwrap(), foreign.clone()]
        }))
        .unwrap();

        let out = InjectionEngine::default().inject(&input, &template()).unwrap();
        let TargetObject::List(list) = out else {
            panic!("List must stay a list");
        };

        let pod = TargetObject::from_value(list.items[0].clone()).unwrap();
        assert_eq!(container_names(&pod), ["fuse", "app"]);
        assert_eq!(list.items[1], foreign);
    }

    #[test]
    fn lists_reject_undecodable_items() {
        let input = TargetObject::from_value(json!({
            "apiVersion": "v1",
            "kind": "List",
            "items": [{"metadata": {"name": "no-kind"}}]
        }))
        .unwrap();

        let err = InjectionEngine::default().inject(&input, &template()).unwrap_err();
        assert!(matches!(err, InjectError::DecodeListItem { index: 0, .. }));
    }

    #[test]
    fn collects_claim_names() {
        let engine = InjectionEngine::default();

        assert_eq!(engine.claim_names(&activated_pod()).unwrap(), ["dataset1"]);
        assert_eq!(engine.claim_names(&tf_job()).unwrap(), ["dataset1"]);
    }

    #[test]
    fn collects_claim_volumes_in_document_order() {
        let input = TargetObject::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "app"},
            "spec": {
                "containers": [{"name": "app", "image": "nginx"}],
                "volumes": [
                    {"name": "data", "persistentVolumeClaim": {"claimName": "dataset1"}},
                    {"name": "scratch", "emptyDir": {}},
                    {"name": "data-again", "persistentVolumeClaim": {"claimName": "dataset1"}}
                ]
            }
        }))
        .unwrap();
        let engine = InjectionEngine::default();

        let volume_names: Vec<_> = engine
            .claim_volumes(&input)
            .unwrap()
            .into_iter()
            .map(|volume| volume.volume_name)
            .collect();
        assert_eq!(volume_names, ["data", "data-again"]);
        assert_eq!(engine.claim_names(&input).unwrap(), ["dataset1"]);
    }

    fn done_label(metadata: Option<&ObjectMeta>) -> Option<&str> {
        metadata?.labels.as_ref()?.get(INJECT_SIDECAR_DONE_LABEL).map(String::as_str)
    }

    #[test]
    fn injected_pod_specs_are_marked_done() {
        let out = InjectionEngine::default()
            .inject(&activated_pod(), &template())
            .unwrap();
        assert_eq!(done_label(out.metadata()), Some("true"));

        let deployment = TargetObject::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "annotations": {INJECT_ANNOTATION: "true"}},
            "spec": {
                "selector": {"matchLabels": {"app": "web"}},
                "template": {"spec": {"containers": [{"name": "web", "image": "nginx"}]}}
            }
        }))
        .unwrap();

        let out = InjectionEngine::default().inject(&deployment, &template()).unwrap();
        assert_eq!(done_label(out.pod_metadata()), Some("true"));
        assert_eq!(done_label(out.metadata()), None);
    }

    #[test]
    fn pod_specs_marked_done_are_skipped() {
        let mut input = activated_pod();
        mark_done(input.metadata_mut().unwrap());

        let out = InjectionEngine::default().inject(&input, &template()).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn dataset_mounts_propagate_from_host() {
        let input = TargetObject::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "app", "annotations": {INJECT_ANNOTATION: "true"}},
            "spec": {
                "initContainers": [{
                    "name": "prepare",
                    "volumeMounts": [{"name": "dataset1", "mountPath": "/data"}]
                }],
                "containers": [{
                    "name": "app",
                    "volumeMounts": [
                        {"name": "dataset1", "mountPath": "/data"},
                        {"name": "scratch", "mountPath": "/scratch"}
                    ]
                }],
                "volumes": [
                    {"name": "dataset1", "persistentVolumeClaim": {"claimName": "dataset1"}},
                    {"name": "scratch", "emptyDir": {}}
                ]
            }
        }))
        .unwrap();

        let out = InjectionEngine::default().inject(&input, &template()).unwrap();
        let pod_spec = out.pod_spec().unwrap();

        let propagation = |container: &Container, mount: usize| {
            container.volume_mounts.as_ref().unwrap()[mount]
                .mount_propagation
                .clone()
        };
        let app = &pod_spec.containers[1];
        let prepare = &pod_spec.init_containers.as_ref().unwrap()[0];

        assert_eq!(propagation(app, 0).as_deref(), Some(HOST_TO_CONTAINER));
        assert_eq!(propagation(app, 1), None);
        assert_eq!(propagation(prepare, 0).as_deref(), Some(HOST_TO_CONTAINER));
        assert_eq!(pod_spec.containers[0].volume_mounts, None);
    }

    #[test]
    fn injects_one_sidecar_per_template() {
        let input = TargetObject::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "app", "annotations": {INJECT_ANNOTATION: "true"}},
            "spec": {
                "containers": [{"name": "app", "image": "nginx"}],
                "volumes": [
                    {"name": "dataset1", "persistentVolumeClaim": {"claimName": "dataset1"}},
                    {"name": "dataset2", "persistentVolumeClaim": {"claimName": "dataset2"}}
                ]
            }
        }))
        .unwrap();
        let second = InjectionTemplate::builder()
            .fuse_container(template().fuse_container().clone())
            .volumes_to_add(vec![host_path_volume("fuse-device", "/dev/fuse")])
            .volumes_to_update(vec![host_path_volume("dataset2", "/runtime-mnt/default/dataset2")])
            .build();
        let engine = InjectionEngine::default();

        let out = engine.inject_all(&input, &[template(), second.clone()]).unwrap();

        assert_eq!(container_names(&out), ["fuse-1", "fuse-0", "app"]);
        assert_eq!(
            volume_names(&out),
            ["dataset1", "dataset2", "fuse-device-0", "fuse-device-1"]
        );
        assert_eq!(out, engine.inject_all(&out, &[template(), second]).unwrap());
    }

    #[test]
    fn no_templates_leave_object_unchanged() {
        let input = activated_pod();

        let out = InjectionEngine::default().inject_all(&input, &[]).unwrap();
        assert_eq!(out, input);
    }
}
