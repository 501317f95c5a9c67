//! Looks up datasets, runtimes and fuse templates in the cluster.
//!
//! A dataset is exposed to workloads through a persistent volume claim named
//! like the dataset, which is bound to a volume served by the Fluid CSI
//! driver. The fuse of the runtime serving the dataset runs as a daemon set,
//! whose first container is the template of the injected sidecar.
use std::collections::BTreeMap;

use async_trait::async_trait;
use fluid_injector::{
    FUSE_CONTAINER_NAME, InjectionTemplate, NamespacedName,
    cache::{
        DatasetResolver, FuseSidecarOptions, LookupError, RuntimeInfo, TemplateProvider,
        runtime_info::{LookupClaimSnafu, LookupObjectSnafu, MalformedObjectSnafu, MissingObjectSnafu},
    },
};
use k8s_openapi::{
    api::{
        apps::v1::DaemonSet,
        core::v1::{
            Container, HostPathVolumeSource, PersistentVolume, PersistentVolumeClaim, Volume,
            VolumeMount,
        },
    },
    apimachinery::pkg::api::resource::Quantity,
};
use kube::{
    Api, Client, ResourceExt,
    api::{ApiResource, DynamicObject, GroupVersionKind},
};
use snafu::{OptionExt, ResultExt};
use tracing::{debug, instrument};

/// Label carried by persistent volume claims which expose a dataset.
pub const DATASET_ID_LABEL: &str = "fluid.io/dataset-id";

/// CSI volume attribute holding the fuse mount point on the node.
pub const FLUID_PATH_ATTRIBUTE: &str = "fluid_path";

/// CSI volume attribute holding the dataset sub path below the mount point.
pub const FLUID_SUBPATH_ATTRIBUTE: &str = "subpath";

/// Extended resource of the virtual fuse device used by unprivileged sidecars.
pub const FUSE_DEVICE_RESOURCE_NAME: &str = "fluid.io/fuse";

const FLUID_DATA_GROUP: &str = "data.fluid.io";
const FLUID_DATA_VERSION: &str = "v1alpha1";

/// Volumes holding runtime caches. Names are matched by prefix.
const CACHE_DIR_VOLUMES: &[&str] = &["datavolume-", "volume-localtime", "cache-dir", "mem", "ssd", "hdd"];

/// Host mount points of the runtime fuses.
const HOST_MOUNT_VOLUMES: &[&str] = &[
    "alluxio-fuse-mount",
    "jindofs-fuse-mount",
    "goosefs-fuse-mount",
    "juicefs-fuse-mount",
    "thin-fuse-mount",
    "efc-fuse-mount",
    "efc-sock",
];

/// Host fuse devices of the runtime fuses.
const HOST_FUSE_DEVICE_VOLUMES: &[&str] = &[
    "alluxio-fuse-device",
    "jindofs-fuse-device",
    "goosefs-fuse-device",
    "thin-fuse-device",
];

const SYS_ADMIN_CAPABILITY: &str = "SYS_ADMIN";

/// Returns the kind of the runtime CR of `runtime_type`.
fn runtime_kind(runtime_type: &str) -> Option<&'static str> {
    Some(match runtime_type {
        "alluxio" => "AlluxioRuntime",
        "jindo" => "JindoRuntime",
        "goosefs" => "GooseFSRuntime",
        "juicefs" => "JuiceFSRuntime",
        "thin" => "ThinRuntime",
        "efc" => "EFCRuntime",
        "vineyard" => "VineyardRuntime",
        _ => return None,
    })
}

fn fluid_api_resource(kind: &str, plural: &str) -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk(FLUID_DATA_GROUP, FLUID_DATA_VERSION, kind),
        plural,
    )
}

/// Resolves claims through the Kubernetes API.
#[derive(Clone)]
pub struct KubeDatasetResolver {
    client: Client,
}

impl KubeDatasetResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn claim(&self, namespace: &str, claim: &str) -> Result<Option<PersistentVolumeClaim>, LookupError> {
        Api::<PersistentVolumeClaim>::namespaced(self.client.clone(), namespace)
            .get_opt(claim)
            .await
            .with_context(|_| LookupClaimSnafu {
                claim: NamespacedName::new(namespace, claim),
            })
    }

    async fn fluid_object(
        &self,
        kind: &'static str,
        plural: &str,
        object: &NamespacedName,
    ) -> Result<DynamicObject, LookupError> {
        let resource = fluid_api_resource(kind, plural);

        Api::<DynamicObject>::namespaced_with(self.client.clone(), &object.namespace, &resource)
            .get_opt(&object.name)
            .await
            .with_context(|_| LookupObjectSnafu {
                kind,
                object: object.clone(),
            })?
            .with_context(|| MissingObjectSnafu {
                kind,
                object: object.clone(),
            })
    }
}

#[async_trait]
impl DatasetResolver for KubeDatasetResolver {
    async fn claim_uid(&self, namespace: &str, claim: &str) -> Result<Option<String>, LookupError> {
        Ok(self
            .claim(namespace, claim)
            .await?
            .and_then(|claim| claim.metadata.uid))
    }

    #[instrument(name = "resolve_dataset", skip(self))]
    async fn resolve(&self, namespace: &str, claim: &str) -> Result<Option<RuntimeInfo>, LookupError> {
        let Some(pvc) = self.claim(namespace, claim).await? else {
            return Ok(None);
        };
        if !pvc.labels().contains_key(DATASET_ID_LABEL) {
            return Ok(None);
        }

        // Datasets are exposed through a claim named like the dataset.
        let dataset = NamespacedName::new(namespace, claim);
        let dataset_object = self.fluid_object("Dataset", "datasets", &dataset).await?;
        let runtime_type = dataset_runtime_type(&dataset_object).with_context(|| MalformedObjectSnafu {
            kind: "Dataset",
            object: dataset.clone(),
            reason: "the dataset is not bound to a runtime",
        })?;

        let kind = runtime_kind(&runtime_type).with_context(|| MalformedObjectSnafu {
            kind: "Dataset",
            object: dataset.clone(),
            reason: format!("unsupported runtime type {runtime_type:?}"),
        })?;
        let runtime_object = self
            .fluid_object(kind, &format!("{runtime_type}runtimes"), &dataset)
            .await?;
        let global_fuse = runtime_global_fuse(&runtime_object);

        debug!(
            dataset.runtime = %runtime_type,
            dataset.global_fuse = global_fuse,
            "resolved dataset runtime"
        );
        Ok(Some(RuntimeInfo {
            dataset,
            runtime_type,
            global_fuse,
            claim_uid: pvc.metadata.uid.unwrap_or_default(),
        }))
    }
}

fn dataset_runtime_type(dataset: &DynamicObject) -> Option<String> {
    dataset
        .data
        .pointer("/status/runtimes/0/type")
        .and_then(serde_json::Value::as_str)
        .filter(|runtime_type| !runtime_type.is_empty())
        .map(str::to_lowercase)
}

/// Runtimes run their fuse globally unless configured otherwise.
fn runtime_global_fuse(runtime: &DynamicObject) -> bool {
    runtime
        .data
        .pointer("/spec/fuse/global")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(true)
}

/// Renders fuse templates from the fuse daemon set of the dataset runtime.
#[derive(Clone)]
pub struct DaemonSetTemplateProvider {
    client: Client,
}

impl DaemonSetTemplateProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Returns the node path the dataset volume of `claim` is mounted at.
    async fn mount_path(&self, claim: &NamespacedName) -> Result<String, LookupError> {
        let pvc = Api::<PersistentVolumeClaim>::namespaced(self.client.clone(), &claim.namespace)
            .get_opt(&claim.name)
            .await
            .context(LookupClaimSnafu {
                claim: claim.clone(),
            })?
            .context(MissingObjectSnafu {
                kind: "PersistentVolumeClaim",
                object: claim.clone(),
            })?;

        let volume_name = pvc
            .spec
            .and_then(|spec| spec.volume_name)
            .filter(|volume_name| !volume_name.is_empty())
            .context(MalformedObjectSnafu {
                kind: "PersistentVolumeClaim",
                object: claim.clone(),
                reason: "the claim is not bound",
            })?;
        let volume = NamespacedName::new("", &volume_name);

        let pv = Api::<PersistentVolume>::all(self.client.clone())
            .get_opt(&volume_name)
            .await
            .context(LookupObjectSnafu {
                kind: "PersistentVolume",
                object: volume.clone(),
            })?
            .context(MissingObjectSnafu {
                kind: "PersistentVolume",
                object: volume.clone(),
            })?;

        volume_mount_path(&pv).context(MalformedObjectSnafu {
            kind: "PersistentVolume",
            object: volume,
            reason: format!("the volume has no {FLUID_PATH_ATTRIBUTE:?} attribute"),
        })
    }
}

#[async_trait]
impl TemplateProvider for DaemonSetTemplateProvider {
    #[instrument(name = "render_fuse_template", skip(self, runtime), fields(dataset.runtime = %runtime.runtime_type))]
    async fn template(
        &self,
        claim: &NamespacedName,
        runtime: &RuntimeInfo,
        options: &FuseSidecarOptions,
    ) -> Result<InjectionTemplate, LookupError> {
        let daemon_set = NamespacedName::new(
            &runtime.dataset.namespace,
            fuse_daemon_set_name(&runtime.dataset.name, &runtime.runtime_type),
        );
        let fuse = Api::<DaemonSet>::namespaced(self.client.clone(), &daemon_set.namespace)
            .get_opt(&daemon_set.name)
            .await
            .context(LookupObjectSnafu {
                kind: "DaemonSet",
                object: daemon_set.clone(),
            })?
            .context(MissingObjectSnafu {
                kind: "DaemonSet",
                object: daemon_set.clone(),
            })?;

        let mount_path = self.mount_path(claim).await?;

        render_fuse_template(&fuse, options, &claim.name, mount_path).context(MalformedObjectSnafu {
            kind: "DaemonSet",
            object: daemon_set,
            reason: "the fuse daemon set has no container",
        })
    }
}

/// Returns the name of the fuse daemon set of a runtime.
pub fn fuse_daemon_set_name(runtime_name: &str, runtime_type: &str) -> String {
    match runtime_type {
        "jindo" => format!("{runtime_name}-jindofs-fuse"),
        _ => format!("{runtime_name}-fuse"),
    }
}

/// Returns the node path of a Fluid CSI volume, including its sub path.
pub fn volume_mount_path(pv: &PersistentVolume) -> Option<String> {
    let attributes = pv.spec.as_ref()?.csi.as_ref()?.volume_attributes.as_ref()?;
    let path = attributes
        .get(FLUID_PATH_ATTRIBUTE)
        .filter(|path| !path.is_empty())?;

    Some(match attributes.get(FLUID_SUBPATH_ATTRIBUTE) {
        Some(sub_path) if !sub_path.is_empty() => format!("{path}/{sub_path}"),
        _ => path.clone(),
    })
}

/// Renders the template of the fuse sidecar for `claim_name` from the fuse
/// daemon set of its runtime. Returns [`None`] if the daemon set has no
/// container.
pub fn render_fuse_template(
    fuse: &DaemonSet,
    options: &FuseSidecarOptions,
    claim_name: &str,
    mount_path: String,
) -> Option<InjectionTemplate> {
    let pod_spec = fuse.spec.as_ref()?.template.spec.as_ref()?;
    let mut fuse_container = pod_spec.containers.first()?.clone();

    let mounted: Vec<&str> = fuse_container
        .volume_mounts
        .iter()
        .flatten()
        .map(|mount| mount.name.as_str())
        .collect();
    let mut volumes_to_add: Vec<Volume> = pod_spec
        .volumes
        .iter()
        .flatten()
        .filter(|volume| mounted.contains(&volume.name.as_str()))
        .cloned()
        .collect();

    if !options.enable_cache_dir {
        trim_volumes(&mut fuse_container, &mut volumes_to_add, CACHE_DIR_VOLUMES);
    }

    if options.unprivileged_sidecar {
        trim_volumes(&mut fuse_container, &mut volumes_to_add, HOST_MOUNT_VOLUMES);
        trim_volumes(&mut fuse_container, &mut volumes_to_add, HOST_FUSE_DEVICE_VOLUMES);
        make_unprivileged(&mut fuse_container);
    }

    fuse_container.name = FUSE_CONTAINER_NAME.to_owned();

    Some(
        InjectionTemplate::builder()
            .fuse_container(fuse_container)
            .volumes_to_add(volumes_to_add)
            .volumes_to_update(vec![Volume {
                name: claim_name.to_owned(),
                host_path: Some(HostPathVolumeSource {
                    path: mount_path,
                    type_: None,
                }),
                ..Volume::default()
            }])
            .build(),
    )
}

/// Drops the volumes and mounts whose names start with any of `prefixes`.
fn trim_volumes(container: &mut Container, volumes: &mut Vec<Volume>, prefixes: &[&str]) {
    let trimmed = |name: &str| prefixes.iter().any(|prefix| name.starts_with(prefix));

    volumes.retain(|volume| !trimmed(&volume.name));
    if let Some(mounts) = container.volume_mounts.as_mut() {
        mounts.retain(|mount: &VolumeMount| !trimmed(&mount.name));
    }
}

/// Requests the virtual fuse device instead of running privileged.
fn make_unprivileged(container: &mut Container) {
    let resources = container.resources.get_or_insert_with(Default::default);
    for quantities in [&mut resources.limits, &mut resources.requests] {
        quantities
            .get_or_insert_with(BTreeMap::new)
            .insert(FUSE_DEVICE_RESOURCE_NAME.to_owned(), Quantity("1".to_owned()));
    }

    if let Some(security_context) = container.security_context.as_mut() {
        security_context.privileged = Some(false);

        if let Some(added) = security_context
            .capabilities
            .as_mut()
            .and_then(|capabilities| capabilities.add.as_mut())
        {
            added.retain(|capability| capability != SYS_ADMIN_CAPABILITY);
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn fuse_daemon_set() -> DaemonSet {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "DaemonSet",
            "metadata": {"name": "hbase-jindofs-fuse", "namespace": "big-data"},
            "spec": {
                "selector": {},
                "template": {
                    "spec": {
                        "containers": [{
                            "name": "fuse",
                            "image": "jindofs/jindo-fuse",
                            "securityContext": {
                                "privileged": true,
                                "capabilities": {"add": ["SYS_ADMIN", "NET_ADMIN"]}
                            },
                            "volumeMounts": [
                                {"name": "datavolume-1", "mountPath": "/mnt/disk1"},
                                {"name": "jindofs-fuse-device", "mountPath": "/dev/fuse"},
                                {"name": "jindofs-fuse-mount", "mountPath": "/jfs"}
                            ]
                        }],
                        "volumes": [
                            {"name": "datavolume-1", "hostPath": {"path": "/mnt/disk1"}},
                            {"name": "jindofs-fuse-device", "hostPath": {"path": "/dev/fuse"}},
                            {"name": "jindofs-fuse-mount", "hostPath": {"path": "/runtime-mnt/jindo/big-data/hbase"}},
                            {"name": "unmounted", "emptyDir": {}}
                        ]
                    }
                }
            }
        }))
        .unwrap()
    }

    fn names(template: &InjectionTemplate) -> (Vec<&str>, Vec<&str>) {
        let mounts = template
            .fuse_container()
            .volume_mounts
            .iter()
            .flatten()
            .map(|mount| mount.name.as_str())
            .collect();
        let volumes = template
            .volumes_to_add()
            .iter()
            .map(|volume| volume.name.as_str())
            .collect();

        (mounts, volumes)
    }

    #[rstest]
    #[case::jindo("hbase", "jindo", "hbase-jindofs-fuse")]
    #[case::alluxio("hbase", "alluxio", "hbase-fuse")]
    fn daemon_set_names(#[case] name: &str, #[case] runtime_type: &str, #[case] expected: &str) {
        assert_eq!(fuse_daemon_set_name(name, runtime_type), expected);
    }

    #[rstest]
    #[case::path_only(json!({"fluid_path": "/runtime-mnt/jindo/big-data/hbase/jindofs-fuse"}), Some("/runtime-mnt/jindo/big-data/hbase/jindofs-fuse"))]
    #[case::sub_path(json!({"fluid_path": "/runtime-mnt/alluxio/default/hbase/alluxio-fuse", "subpath": "logs"}), Some("/runtime-mnt/alluxio/default/hbase/alluxio-fuse/logs"))]
    #[case::missing(json!({"mount_type": "fuse.alluxio-fuse"}), None)]
    fn mount_paths(#[case] attributes: serde_json::Value, #[case] expected: Option<&str>) {
        let pv: PersistentVolume = serde_json::from_value(json!({
            "metadata": {"name": "big-data-hbase"},
            "spec": {"csi": {"driver": "fuse.csi.fluid.io", "volumeHandle": "big-data-hbase", "volumeAttributes": attributes}}
        }))
        .unwrap();

        assert_eq!(volume_mount_path(&pv).as_deref(), expected);
    }

    #[test]
    fn default_template_drops_cache_dirs() {
        let template = render_fuse_template(
            &fuse_daemon_set(),
            &FuseSidecarOptions::default(),
            "hbase",
            "/runtime-mnt/jindo/big-data/hbase/jindofs-fuse".to_owned(),
        )
        .unwrap();

        assert_eq!(template.fuse_container().name, FUSE_CONTAINER_NAME);
        assert_eq!(
            names(&template),
            (
                vec!["jindofs-fuse-device", "jindofs-fuse-mount"],
                vec!["jindofs-fuse-device", "jindofs-fuse-mount"]
            )
        );

        let update = &template.volumes_to_update()[0];
        assert_eq!(update.name, "hbase");
        assert_eq!(
            update.host_path.as_ref().unwrap().path,
            "/runtime-mnt/jindo/big-data/hbase/jindofs-fuse"
        );
    }

    #[test]
    fn unprivileged_template_uses_virtual_fuse_device() {
        let options = FuseSidecarOptions {
            enable_cache_dir: true,
            unprivileged_sidecar: true,
        };
        let template =
            render_fuse_template(&fuse_daemon_set(), &options, "hbase", "/mnt".to_owned()).unwrap();

        assert_eq!(names(&template), (vec!["datavolume-1"], vec!["datavolume-1"]));

        let container = template.fuse_container();
        let security_context = container.security_context.as_ref().unwrap();
        assert_eq!(security_context.privileged, Some(false));
        assert_eq!(
            security_context.capabilities.as_ref().unwrap().add.as_deref(),
            Some(&["NET_ADMIN".to_owned()][..])
        );

        let resources = container.resources.as_ref().unwrap();
        for quantities in [&resources.limits, &resources.requests] {
            assert_eq!(
                quantities.as_ref().unwrap().get(FUSE_DEVICE_RESOURCE_NAME),
                Some(&Quantity("1".to_owned()))
            );
        }
    }

    #[test]
    fn daemon_sets_without_containers_render_nothing() {
        let mut fuse = fuse_daemon_set();
        if let Some(spec) = fuse.spec.as_mut().and_then(|spec| spec.template.spec.as_mut()) {
            spec.containers.clear();
        }

        assert!(
            render_fuse_template(&fuse, &FuseSidecarOptions::default(), "hbase", "/mnt".to_owned())
                .is_none()
        );
    }

    #[rstest]
    #[case::bound(json!({"status": {"runtimes": [{"name": "hbase", "type": "Alluxio"}]}}), Some("alluxio"))]
    #[case::unbound(json!({"status": {}}), None)]
    fn dataset_runtime_types(#[case] data: serde_json::Value, #[case] expected: Option<&str>) {
        let mut dataset = DynamicObject::new("hbase", &fluid_api_resource("Dataset", "datasets"));
        dataset.data = data;

        assert_eq!(dataset_runtime_type(&dataset).as_deref(), expected);
    }

    #[rstest]
    #[case::default(json!({"spec": {}}), true)]
    #[case::sidecar(json!({"spec": {"fuse": {"global": false}}}), false)]
    fn runtime_global_fuses(#[case] data: serde_json::Value, #[case] expected: bool) {
        let mut runtime = DynamicObject::new("hbase", &fluid_api_resource("AlluxioRuntime", "alluxioruntimes"));
        runtime.data = data;

        assert_eq!(runtime_global_fuse(&runtime), expected);
    }
}
