//! Structural lookup of container and volume lists in objects of unknown
//! kinds.
//!
//! Without a schema, list fields are classified by the shape of their
//! elements: containers carry a `name` and an `image`, volumes carry a `name`
//! and one of the Kubernetes volume sources. An object holding a container
//! list is treated as a pod spec. Within every pod spec, exactly one
//! container field and at most one volume field must remain after applying
//! the [`ResolveOptions`], everything else is ambiguous.
use std::fmt;

use serde_json::{Map, Value};
use snafu::Snafu;

/// Volume sources a Kubernetes volume can be backed by.
const VOLUME_SOURCES: &[&str] = &[
    "awsElasticBlockStore",
    "azureDisk",
    "azureFile",
    "cephfs",
    "cinder",
    "configMap",
    "csi",
    "downwardAPI",
    "emptyDir",
    "ephemeral",
    "fc",
    "flexVolume",
    "flocker",
    "gcePersistentDisk",
    "gitRepo",
    "glusterfs",
    "hostPath",
    "image",
    "iscsi",
    "nfs",
    "persistentVolumeClaim",
    "photonPersistentDisk",
    "portworxVolume",
    "projected",
    "quobyte",
    "rbd",
    "scaleIO",
    "secret",
    "storageos",
    "vsphereVolume",
];

/// Name of the volume list of a pod spec, used when no volume list exists
/// yet.
pub const DEFAULT_VOLUMES_FIELD: &str = "volumes";

const DEFAULT_CONTAINERS_FIELD: &str = "containers";

pub type Result<T, E = ResolveError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum ResolveError {
    #[snafu(display("the object contains no container list"))]
    NoPodSpec,

    #[snafu(display(
        "expected exactly one {element} field at {pointer:?}, found candidates {candidates:?}"
    ))]
    AmbiguousField {
        element: ElementKind,
        pointer: String,
        candidates: Vec<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementKind {
    Container,
    Volume,
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Container => f.write_str("container"),
            Self::Volume => f.write_str("volume"),
        }
    }
}

/// Caller preferences for resolving list fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Container field which wins whenever it is a candidate.
    pub container_nominee: Option<String>,

    /// Volume field which wins whenever it is a candidate.
    pub volume_nominee: Option<String>,

    /// Candidates whose name contains one of these strings (ignoring case)
    /// are dropped, unless a nominee matched.
    pub exclusions: Vec<String>,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            container_nominee: None,
            volume_nominee: None,
            exclusions: vec!["init".to_owned(), "ephemeral".to_owned()],
        }
    }
}

/// A pod spec located inside an object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodSpecFields {
    /// JSON pointer of the pod spec, relative to the searched value.
    pub pointer: String,

    /// Name of the container list field.
    pub containers: String,

    /// Name of the volume list field. It may not exist yet.
    pub volumes: String,
}

/// Locates pod specs and their list fields in arbitrary JSON.
#[derive(Clone, Copy, Debug)]
pub struct ObjectFieldResolver<'a> {
    options: &'a ResolveOptions,
}

impl<'a> ObjectFieldResolver<'a> {
    pub fn new(options: &'a ResolveOptions) -> Self {
        Self { options }
    }

    /// Returns every pod spec found in `value`, in document order.
    pub fn resolve(&self, value: &Value) -> Result<Vec<PodSpecFields>> {
        let mut pod_specs = Vec::new();
        self.walk(value, String::new(), &mut pod_specs)?;

        if pod_specs.is_empty() {
            return NoPodSpecSnafu.fail();
        }

        Ok(pod_specs)
    }

    /// Picks the single `element` field among the `candidates` found in the
    /// pod spec at `pointer`.
    pub fn find_field(
        &self,
        element: ElementKind,
        pointer: &str,
        candidates: Vec<String>,
    ) -> Result<String> {
        let nominee = match element {
            ElementKind::Container => self.options.container_nominee.as_deref(),
            ElementKind::Volume => self.options.volume_nominee.as_deref(),
        };

        let nominated =
            nominee.filter(|nominee| candidates.iter().any(|candidate| candidate == nominee));
        if let Some(nominee) = nominated {
            return Ok(nominee.to_owned());
        }

        let remaining = candidates
            .iter()
            .filter(|candidate| !self.is_excluded(candidate))
            .collect::<Vec<_>>();

        match remaining.as_slice() {
            [field] => Ok((*field).clone()),
            _ => AmbiguousFieldSnafu {
                element,
                pointer,
                candidates,
            }
            .fail(),
        }
    }

    fn is_excluded(&self, candidate: &str) -> bool {
        let candidate = candidate.to_lowercase();
        self.options
            .exclusions
            .iter()
            .any(|exclusion| candidate.contains(&exclusion.to_lowercase()))
    }

    fn walk(&self, value: &Value, pointer: String, pod_specs: &mut Vec<PodSpecFields>) -> Result<()> {
        match value {
            Value::Object(object) => {
                if is_pod_spec(object) {
                    pod_specs.push(self.pod_spec_fields(object, &pointer)?);
                }

                for (key, child) in object {
                    self.walk(child, format!("{pointer}/{}", escape(key)), pod_specs)?;
                }
            }
            Value::Array(items) => {
                for (index, child) in items.iter().enumerate() {
                    self.walk(child, format!("{pointer}/{index}"), pod_specs)?;
                }
            }
            _ => {}
        }

        Ok(())
    }

    fn pod_spec_fields(&self, object: &Map<String, Value>, pointer: &str) -> Result<PodSpecFields> {
        let containers = self.find_field(
            ElementKind::Container,
            pointer,
            candidates(object, ElementKind::Container),
        )?;

        let volume_candidates = candidates(object, ElementKind::Volume);
        let volumes = if volume_candidates.is_empty() {
            DEFAULT_VOLUMES_FIELD.to_owned()
        } else {
            self.find_field(ElementKind::Volume, pointer, volume_candidates)?
        };

        Ok(PodSpecFields {
            pointer: pointer.to_owned(),
            containers,
            volumes,
        })
    }
}

/// An object is a pod spec if it holds a non-empty container list or an
/// empty `containers` list.
fn is_pod_spec(object: &Map<String, Value>) -> bool {
    object.iter().any(|(key, value)| match value {
        Value::Array(items) if items.is_empty() => key == DEFAULT_CONTAINERS_FIELD,
        Value::Array(items) => items.iter().all(is_container),
        _ => false,
    })
}

/// Returns the names of all list fields of `object` holding `element`s.
/// Empty lists are classified by their name.
fn candidates(object: &Map<String, Value>, element: ElementKind) -> Vec<String> {
    let (matches, name_hint): (fn(&Value) -> bool, &str) = match element {
        ElementKind::Container => (is_container, "container"),
        ElementKind::Volume => (is_volume, "volume"),
    };

    object
        .iter()
        .filter(|(key, value)| match value {
            Value::Array(items) if items.is_empty() => key.to_lowercase().contains(name_hint),
            Value::Array(items) => items.iter().all(matches),
            _ => false,
        })
        .map(|(key, _)| key.clone())
        .collect()
}

fn is_container(value: &Value) -> bool {
    value.get("name").is_some_and(Value::is_string)
        && value.get("image").is_some_and(Value::is_string)
}

// Image volumes carry an object under `image`, containers a string
fn is_volume(value: &Value) -> bool {
    value.get("name").is_some_and(Value::is_string)
        && !is_container(value)
        && VOLUME_SOURCES.iter().any(|source| value.get(source).is_some())
}

/// Escapes a key for use in a JSON pointer, see RFC 6901.
fn escape(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}
