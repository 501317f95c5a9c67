use bon::Builder;
use k8s_openapi::api::core::v1::{Container, Volume};

/// Describes what gets injected into a pod spec.
///
/// Templates are rendered per dataset by the runtime which serves it and are
/// never modified afterwards.
///
/// ```
/// use fluid_injector::InjectionTemplate;
/// use k8s_openapi::api::core::v1::Container;
///
/// let template = InjectionTemplate::builder()
///     .fuse_container(Container {
///         name: "fluid-fuse".to_owned(),
///         ..Container::default()
///     })
///     .build();
/// assert!(template.volumes_to_add().is_empty());
/// ```
#[derive(Builder, Clone, Debug, PartialEq)]
pub struct InjectionTemplate {
    /// The container prepended to the container list.
    fuse_container: Container,

    /// Volumes appended to the volume list, in order.
    #[builder(default)]
    volumes_to_add: Vec<Volume>,

    /// Volumes replacing the existing volume with the same name.
    #[builder(default)]
    volumes_to_update: Vec<Volume>,
}

impl InjectionTemplate {
    pub fn fuse_container(&self) -> &Container {
        &self.fuse_container
    }

    pub fn volumes_to_add(&self) -> &[Volume] {
        &self.volumes_to_add
    }

    pub fn volumes_to_update(&self) -> &[Volume] {
        &self.volumes_to_update
    }

    /// Returns a copy whose volume updates apply to `volume_names`.
    ///
    /// Rendered templates describe the dataset volume once, independent of
    /// how an object names the volumes backed by the dataset claim. Each of
    /// `volume_names` receives the source of the first volume update. A
    /// template without volume updates is returned unchanged.
    pub fn for_volumes<S>(&self, volume_names: &[S]) -> Self
    where
        S: AsRef<str>,
    {
        let Some(source) = self.volumes_to_update.first() else {
            return self.clone();
        };

        let volumes_to_update = volume_names
            .iter()
            .map(|name| Volume {
                name: name.as_ref().to_owned(),
                ..source.clone()
            })
            .collect();

        Self {
            volumes_to_update,
            ..self.clone()
        }
    }

    /// Returns a copy whose fuse container and added volumes carry `suffix`,
    /// so that the sidecars of several datasets can share one pod spec. The
    /// mounts of the fuse container follow the renamed volumes.
    pub fn with_name_suffix(&self, suffix: &str) -> Self {
        let mut template = self.clone();
        template.fuse_container.name.push_str(suffix);

        for volume in &mut template.volumes_to_add {
            let name = format!("{name}{suffix}", name = volume.name);
            for mount in template.fuse_container.volume_mounts.iter_mut().flatten() {
                if mount.name == volume.name {
                    mount.name.clone_from(&name);
                }
            }
            volume.name = name;
        }

        template
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{HostPathVolumeSource, VolumeMount};

    use super::*;

    #[test]
    fn retargets_volume_updates() {
        let host_path = HostPathVolumeSource {
            path: "/runtime-mnt/alluxio/default/dataset1/alluxio-fuse".to_owned(),
            ..HostPathVolumeSource::default()
        };
        let template = InjectionTemplate::builder()
            .fuse_container(Container::default())
            .volumes_to_update(vec![Volume {
                name: "dataset1".to_owned(),
                host_path: Some(host_path.clone()),
                ..Volume::default()
            }])
            .build();

        let retargeted = template.for_volumes(&["data", "data-again"]);

        let names: Vec<_> = retargeted.volumes_to_update().iter().map(|volume| volume.name.as_str()).collect();
        assert_eq!(names, ["data", "data-again"]);
        assert!(
            retargeted
                .volumes_to_update()
                .iter()
                .all(|volume| volume.host_path.as_ref() == Some(&host_path))
        );
    }

    #[test]
    fn suffixes_container_and_added_volumes() {
        let mount = |name: &str| VolumeMount {
            name: name.to_owned(),
            mount_path: format!("/{name}"),
            ..VolumeMount::default()
        };
        let template = InjectionTemplate::builder()
            .fuse_container(Container {
                name: "fluid-fuse".to_owned(),
                volume_mounts: Some(vec![mount("fuse-device"), mount("cache-dir")]),
                ..Container::default()
            })
            .volumes_to_add(vec![Volume {
                name: "fuse-device".to_owned(),
                ..Volume::default()
            }])
            .volumes_to_update(vec![Volume {
                name: "data".to_owned(),
                ..Volume::default()
            }])
            .build();

        let suffixed = template.with_name_suffix("-1");

        assert_eq!(suffixed.fuse_container().name, "fluid-fuse-1");
        assert_eq!(suffixed.volumes_to_add()[0].name, "fuse-device-1");
        assert_eq!(suffixed.volumes_to_update()[0].name, "data");

        let mounts: Vec<_> = suffixed
            .fuse_container()
            .volume_mounts
            .iter()
            .flatten()
            .map(|mount| mount.name.as_str())
            .collect();
        assert_eq!(mounts, ["fuse-device-1", "cache-dir"]);
    }
}
