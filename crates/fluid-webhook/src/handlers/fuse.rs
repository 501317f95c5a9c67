//! Injects the fuse sidecar of the dataset an object mounts.
use std::sync::Arc;

use async_trait::async_trait;
use fluid_injector::{
    InjectError, InjectionEngine, NamespacedName, TargetObject,
    cache::{
        DatasetResolver, FuseSidecarOptions, FuseTemplateCache, LookupError, RuntimeInfo,
        TemplateProvider,
    },
};
use kube::{
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse},
};
use snafu::{ResultExt, Snafu};
use tracing::{debug, info, warn};

use crate::{
    handlers::{
        AdmissionSettings, Mutation, Prepared, STATUS_INTERNAL_SERVER_ERROR, error_response,
        prepare,
    },
    registry::AdmissionHandler,
};

pub type Result<T, E = FuseInjectionError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum FuseInjectionError {
    #[snafu(display("failed to list the claims of the object"))]
    ListClaims { source: InjectError },

    #[snafu(display("failed to resolve claim {claim:?}"))]
    ResolveClaim { source: LookupError, claim: String },

    #[snafu(display("failed to render the fuse template of dataset {dataset}"))]
    RenderTemplate {
        source: LookupError,
        dataset: NamespacedName,
    },

    #[snafu(display("failed to inject the fuse sidecars"))]
    Inject { source: InjectError },
}

/// Injects a fuse sidecar for every dataset an object mounts through its
/// persistent volume claims.
pub struct FuseInjectionHandler {
    settings: AdmissionSettings,
    engine: InjectionEngine,
    resolver: Arc<dyn DatasetResolver>,
    provider: Arc<dyn TemplateProvider>,
    templates: FuseTemplateCache,
}

impl FuseInjectionHandler {
    pub fn new(
        settings: AdmissionSettings,
        engine: InjectionEngine,
        resolver: Arc<dyn DatasetResolver>,
        provider: Arc<dyn TemplateProvider>,
        templates: FuseTemplateCache,
    ) -> Self {
        Self {
            settings,
            engine,
            resolver,
            provider,
            templates,
        }
    }

    /// Returns the injected object, [`None`] if injection is not activated or
    /// the object mounts no dataset.
    async fn mutate(&self, mutation: &Mutation) -> Result<Option<TargetObject>> {
        if !mutation.target.injection_activated() {
            debug!("injection is not activated, allowing unchanged");
            return Ok(None);
        }

        let claim_volumes = self
            .engine
            .claim_volumes(&mutation.target)
            .context(ListClaimsSnafu)?;

        let mut datasets: Vec<(NamespacedName, RuntimeInfo)> = Vec::new();
        for claim_volume in &claim_volumes {
            let claim = NamespacedName::new(&mutation.namespace, &claim_volume.claim_name);
            if datasets.iter().any(|(bound, _)| *bound == claim) {
                continue;
            }

            let runtime = self
                .resolver
                .resolve(&claim.namespace, &claim.name)
                .await
                .with_context(|_| ResolveClaimSnafu {
                    claim: claim_volume.claim_name.clone(),
                })?;
            match runtime {
                Some(runtime) => datasets.push((claim, runtime)),
                None => debug!(claim = %claim, "claim is not backed by a dataset"),
            }
        }

        if datasets.is_empty() {
            debug!("object mounts no dataset, allowing unchanged");
            return Ok(None);
        }

        let options = FuseSidecarOptions::from_labels(
            mutation
                .target
                .metadata()
                .and_then(|metadata| metadata.labels.as_ref()),
        );

        let mut templates = Vec::with_capacity(datasets.len());
        for (claim, runtime) in &datasets {
            let template = self
                .templates
                .get_or_render(self.provider.as_ref(), claim, runtime, &options)
                .await
                .with_context(|_| RenderTemplateSnafu {
                    dataset: runtime.dataset.clone(),
                })?;

            let volume_names: Vec<&str> = claim_volumes
                .iter()
                .filter(|claim_volume| claim_volume.claim_name == claim.name)
                .map(|claim_volume| claim_volume.volume_name.as_str())
                .collect();

            info!(
                dataset = %runtime.dataset,
                dataset.runtime = %runtime.runtime_type,
                "injecting fuse sidecar"
            );
            templates.push(template.for_volumes(&volume_names));
        }

        self.engine
            .inject_all(&mutation.target, &templates)
            .map(Some)
            .context(InjectSnafu)
    }
}

#[async_trait]
impl AdmissionHandler for FuseInjectionHandler {
    fn name(&self) -> &'static str {
        "fuse-sidecar"
    }

    async fn handle(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        let mutation = match prepare(request, &self.settings) {
            Prepared::Respond(response) => return response,
            Prepared::Mutate(mutation) => mutation,
        };

        match self.mutate(&mutation).await {
            Ok(Some(mutated)) => mutation.respond(request, &mutated),
            Ok(None) => AdmissionResponse::from(request),
            Err(err) => {
                warn!(error = &err as &dyn std::error::Error, "failed to inject fuse sidecar");
                error_response(request, STATUS_INTERNAL_SERVER_ERROR, err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use fluid_injector::{
        INJECT_ANNOTATION, INJECT_SIDECAR_DONE_LABEL, InjectionTemplate,
        cache::{CacheConfig, fuse_template::UNPRIVILEGED_OPTION_LABEL},
        engine::HOST_TO_CONTAINER,
    };
    use k8s_openapi::api::core::v1::{Container, HostPathVolumeSource, Volume};
    use serde_json::{Value, json};

    use super::*;
    use crate::handlers::tests::admission_request;

    struct DatasetClaims;

    #[async_trait]
    impl DatasetResolver for DatasetClaims {
        async fn claim_uid(&self, _: &str, claim: &str) -> Result<Option<String>, LookupError> {
            Ok(Some(format!("{claim}-uid")))
        }

        // Claims starting with "dataset" are backed by a dataset of the same name,
        // claims starting with "broken" fail to resolve.
        async fn resolve(&self, namespace: &str, claim: &str) -> Result<Option<RuntimeInfo>, LookupError> {
            if claim.starts_with("broken") {
                return Err(LookupError::MissingObject {
                    kind: "PersistentVolumeClaim",
                    object: NamespacedName::new(namespace, claim),
                });
            }

            Ok(claim.starts_with("dataset").then(|| RuntimeInfo {
                dataset: NamespacedName::new(namespace, claim),
                runtime_type: "alluxio".to_owned(),
                global_fuse: false,
                claim_uid: format!("{claim}-uid"),
            }))
        }
    }

    #[derive(Default)]
    struct FuseTemplates {
        renders: AtomicUsize,
    }

    #[async_trait]
    impl TemplateProvider for FuseTemplates {
        async fn template(
            &self,
            claim: &NamespacedName,
            _: &RuntimeInfo,
            options: &FuseSidecarOptions,
        ) -> Result<InjectionTemplate, LookupError> {
            self.renders.fetch_add(1, Ordering::SeqCst);

            let privileged = !options.unprivileged_sidecar;
            let fuse_container: Container = serde_json::from_value(json!({
                "name": "fluid-fuse",
                "image": "fluid/alluxio-fuse",
                "securityContext": {"privileged": privileged}
            }))
            .unwrap();

            Ok(InjectionTemplate::builder()
                .fuse_container(fuse_container)
                .volumes_to_add(vec![Volume {
                    name: "fuse-device".to_owned(),
                    host_path: Some(HostPathVolumeSource {
                        path: "/dev/fuse".to_owned(),
                        type_: None,
                    }),
                    ..Volume::default()
                }])
                .volumes_to_update(vec![Volume {
                    name: claim.name.clone(),
                    host_path: Some(HostPathVolumeSource {
                        path: format!("/runtime-mnt/alluxio/{claim}/alluxio-fuse"),
                        type_: None,
                    }),
                    ..Volume::default()
                }])
                .build())
        }
    }

    fn handler(provider: Arc<FuseTemplates>) -> FuseInjectionHandler {
        FuseInjectionHandler::new(
            AdmissionSettings::default(),
            InjectionEngine::default(),
            Arc::new(DatasetClaims),
            provider,
            FuseTemplateCache::new(CacheConfig {
                capacity: 10,
                entry_time_to_live: Duration::from_secs(60),
            }),
        )
    }

    fn pod_with_annotations(labels: Value, annotations: Value, claims: &[(&str, &str)]) -> Value {
        let volumes: Vec<Value> = claims
            .iter()
            .map(|(volume, claim)| json!({"name": volume, "persistentVolumeClaim": {"claimName": claim}}))
            .collect();
        let volume_mounts: Vec<Value> = claims
            .iter()
            .map(|(volume, _)| json!({"name": volume, "mountPath": format!("/data/{volume}")}))
            .collect();

        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "app",
                "namespace": "default",
                "labels": labels,
                "annotations": annotations
            },
            "spec": {
                "containers": [{"name": "app", "volumeMounts": volume_mounts}],
                "volumes": volumes
            }
        })
    }

    fn serverless_pod(labels: Value, claims: &[(&str, &str)]) -> Value {
        pod_with_annotations(labels, json!({INJECT_ANNOTATION: "true"}), claims)
    }

    fn apply(object: &Value, response: &AdmissionResponse) -> Value {
        let patch: json_patch::Patch =
            serde_json::from_slice(response.patch.as_deref().unwrap()).unwrap();
        let mut object = object.clone();
        json_patch::patch(&mut object, &patch.0).unwrap();
        object
    }

    #[tokio::test]
    async fn injects_the_dataset_sidecar() {
        let provider = Arc::new(FuseTemplates::default());
        let pod = serverless_pod(json!({}), &[("data", "dataset1")]);

        let response = handler(Arc::clone(&provider))
            .handle(&admission_request("default", pod.clone()))
            .await;
        assert!(response.allowed);

        let injected = apply(&pod, &response);
        assert_eq!(injected["spec"]["containers"][0]["name"], "fluid-fuse");
        assert_eq!(injected["spec"]["containers"][1]["name"], "app");
        assert_eq!(
            injected["spec"]["containers"][1]["volumeMounts"][0]["mountPropagation"],
            HOST_TO_CONTAINER
        );
        assert_eq!(injected["metadata"]["labels"][INJECT_SIDECAR_DONE_LABEL], "true");
        assert_eq!(
            injected["spec"]["volumes"],
            json!([
                {"name": "data", "hostPath": {"path": "/runtime-mnt/alluxio/default/dataset1/alluxio-fuse"}},
                {"name": "fuse-device", "hostPath": {"path": "/dev/fuse"}}
            ])
        );
    }

    #[tokio::test]
    async fn templates_are_cached_per_option_set() {
        let provider = Arc::new(FuseTemplates::default());
        let handler = handler(Arc::clone(&provider));

        for _ in 0..2 {
            let pod = serverless_pod(json!({}), &[("data", "dataset1")]);
            handler.handle(&admission_request("default", pod)).await;
        }
        assert_eq!(provider.renders.load(Ordering::SeqCst), 1);

        let pod = serverless_pod(
            json!({UNPRIVILEGED_OPTION_LABEL: "true"}),
            &[("data", "dataset1")],
        );
        let response = handler.handle(&admission_request("default", pod.clone())).await;
        assert_eq!(provider.renders.load(Ordering::SeqCst), 2);
        assert_eq!(
            apply(&pod, &response)["spec"]["containers"][0]["securityContext"]["privileged"],
            false
        );
    }

    #[tokio::test]
    async fn objects_without_datasets_are_unchanged() {
        let pod = serverless_pod(json!({}), &[("data", "plain")]);
        let response = handler(Arc::default())
            .handle(&admission_request("default", pod))
            .await;

        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[tokio::test]
    async fn objects_without_activation_are_unchanged() {
        let provider = Arc::new(FuseTemplates::default());
        let pod = pod_with_annotations(
            json!({}),
            json!({}),
            &[("a", "dataset1"), ("b", "dataset2"), ("c", "broken")],
        );

        let response = handler(Arc::clone(&provider))
            .handle(&admission_request("default", pod))
            .await;

        assert!(response.allowed);
        assert!(response.patch.is_none());
        assert_eq!(provider.renders.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_lookups_of_activated_objects_are_internal_errors() {
        let pod = serverless_pod(json!({}), &[("a", "dataset1"), ("c", "broken")]);
        let response = handler(Arc::default())
            .handle(&admission_request("default", pod))
            .await;

        assert!(!response.allowed);
        assert_eq!(response.result.code, STATUS_INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn injects_one_sidecar_per_dataset() {
        let provider = Arc::new(FuseTemplates::default());
        let pod = serverless_pod(json!({}), &[("a", "dataset1"), ("b", "dataset2")]);

        let response = handler(Arc::clone(&provider))
            .handle(&admission_request("default", pod.clone()))
            .await;
        assert!(response.allowed);
        assert_eq!(provider.renders.load(Ordering::SeqCst), 2);

        let injected = apply(&pod, &response);
        let container_names: Vec<&str> = injected["spec"]["containers"]
            .as_array()
            .unwrap()
            .iter()
            .map(|container| container["name"].as_str().unwrap())
            .collect();
        assert_eq!(container_names, ["fluid-fuse-1", "fluid-fuse-0", "app"]);
        assert_eq!(
            injected["spec"]["volumes"],
            json!([
                {"name": "a", "hostPath": {"path": "/runtime-mnt/alluxio/default/dataset1/alluxio-fuse"}},
                {"name": "b", "hostPath": {"path": "/runtime-mnt/alluxio/default/dataset2/alluxio-fuse"}},
                {"name": "fuse-device-0", "hostPath": {"path": "/dev/fuse"}},
                {"name": "fuse-device-1", "hostPath": {"path": "/dev/fuse"}}
            ])
        );
    }

    #[tokio::test]
    async fn volumes_sharing_a_claim_are_all_updated() {
        let pod = serverless_pod(json!({}), &[("a", "dataset1"), ("b", "dataset1")]);
        let response = handler(Arc::default())
            .handle(&admission_request("default", pod.clone()))
            .await;

        let injected = apply(&pod, &response);
        for index in 0..2 {
            assert_eq!(
                injected["spec"]["volumes"][index]["hostPath"]["path"],
                "/runtime-mnt/alluxio/default/dataset1/alluxio-fuse"
            );
        }
    }

    #[tokio::test]
    async fn injected_objects_are_unchanged() {
        let provider = Arc::new(FuseTemplates::default());
        let handler = handler(Arc::clone(&provider));
        let pod = serverless_pod(json!({}), &[("data", "dataset1")]);

        let response = handler.handle(&admission_request("default", pod.clone())).await;
        let injected = apply(&pod, &response);

        let response = handler.handle(&admission_request("default", injected)).await;
        assert!(response.allowed);
        assert!(response.patch.is_none());
    }
}
