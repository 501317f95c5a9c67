//! Prefers nodes which serve the datasets a pod mounts.
use std::{fmt::Write as _, sync::Arc};

use async_trait::async_trait;
use fluid_injector::{
    InjectError, InjectionEngine, NamespacedName, TargetObject,
    cache::{DatasetResolver, LookupError},
};
use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelectorRequirement, NodeSelectorTerm, Pod,
    PreferredSchedulingTerm,
};
use kube::{
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse},
};
use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu};
use tracing::{debug, warn};

use crate::{
    handlers::{AdmissionSettings, Mutation, Prepared, STATUS_INTERNAL_SERVER_ERROR, error_response, prepare},
    registry::AdmissionHandler,
};

/// Label values are limited to 63 characters, longer keys are hashed.
const MAX_LABEL_KEY_LENGTH: usize = 63;

const DATASET_LABEL_PREFIX: &str = "fluid.io/s-";
const DATASET_LABEL_VALUE: &str = "true";
const PREFERENCE_WEIGHT: i32 = 1;

#[derive(Debug, Snafu)]
pub enum NodeAffinityError {
    #[snafu(display("failed to list the claims of the pod"))]
    ListClaims { source: InjectError },

    #[snafu(display("failed to resolve claim {claim:?}"))]
    ResolveClaim { source: LookupError, claim: String },
}

/// Returns the node label marking nodes which serve `dataset`.
pub fn dataset_label_key(dataset: &NamespacedName) -> String {
    let key = format!(
        "{DATASET_LABEL_PREFIX}{namespace}-{name}",
        namespace = dataset.namespace,
        name = dataset.name
    );
    if key.len() <= MAX_LABEL_KEY_LENGTH {
        return key;
    }

    let digest = Sha256::digest(format!(
        "{namespace}-{name}",
        namespace = dataset.namespace,
        name = dataset.name
    ));
    let hash = digest.iter().take(8).fold(String::new(), |mut hash, byte| {
        let _ = write!(hash, "{byte:02x}");
        hash
    });

    format!("{DATASET_LABEL_PREFIX}h-{hash}")
}

/// Adds a preferred node affinity term per dataset-backed claim of a pod.
///
/// Datasets whose runtime runs its fuse globally prefer nodes carrying the
/// dataset label, all other datasets prefer nodes without it.
pub struct NodeAffinityHandler {
    settings: AdmissionSettings,
    engine: InjectionEngine,
    resolver: Arc<dyn DatasetResolver>,
}

impl NodeAffinityHandler {
    pub fn new(settings: AdmissionSettings, resolver: Arc<dyn DatasetResolver>) -> Self {
        Self {
            settings,
            engine: InjectionEngine::default(),
            resolver,
        }
    }

    /// Claims which fail to resolve are skipped, unless the pod activates
    /// sidecar injection and thus depends on every dataset it mounts.
    async fn preferences(&self, mutation: &Mutation) -> Result<Vec<PreferredSchedulingTerm>, NodeAffinityError> {
        let serverless = mutation.target.injection_activated();
        let mut preferences = Vec::new();

        for claim in self
            .engine
            .claim_names(&mutation.target)
            .context(ListClaimsSnafu)?
        {
            let runtime = match self.resolver.resolve(&mutation.namespace, &claim).await {
                Ok(runtime) => runtime,
                Err(source) if serverless => return Err(source).context(ResolveClaimSnafu { claim }),
                Err(err) => {
                    warn!(
                        claim = %claim,
                        error = &err as &dyn std::error::Error,
                        "failed to resolve claim, skipping it"
                    );
                    continue;
                }
            };
            let Some(runtime) = runtime else {
                debug!(claim = %claim, "claim is not backed by a dataset");
                continue;
            };

            let operator = if runtime.global_fuse { "In" } else { "NotIn" };
            preferences.push(preferred_term(&dataset_label_key(&runtime.dataset), operator));
        }

        Ok(preferences)
    }
}

#[async_trait]
impl AdmissionHandler for NodeAffinityHandler {
    fn name(&self) -> &'static str {
        "node-affinity"
    }

    async fn handle(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        let mutation = match prepare(request, &self.settings) {
            Prepared::Respond(response) => return response,
            Prepared::Mutate(mutation) => mutation,
        };

        let TargetObject::Pod(pod) = &mutation.target else {
            debug!(kind = mutation.target.kind(), "only pods are scheduled, allowing unchanged");
            return AdmissionResponse::from(request);
        };

        let preferences = match self.preferences(&mutation).await {
            Ok(preferences) => preferences,
            Err(err) => {
                warn!(error = &err as &dyn std::error::Error, "failed to compute node preferences");
                return error_response(request, STATUS_INTERNAL_SERVER_ERROR, err.to_string());
            }
        };

        let mut pod = pod.clone();
        add_preferences(&mut pod, preferences);
        mutation.respond(request, &TargetObject::Pod(pod))
    }
}

fn preferred_term(key: &str, operator: &str) -> PreferredSchedulingTerm {
    PreferredSchedulingTerm {
        weight: PREFERENCE_WEIGHT,
        preference: NodeSelectorTerm {
            match_expressions: Some(vec![NodeSelectorRequirement {
                key: key.to_owned(),
                operator: operator.to_owned(),
                values: Some(vec![DATASET_LABEL_VALUE.to_owned()]),
            }]),
            match_fields: None,
        },
    }
}

/// Appends the `preferences` the pod does not carry yet.
fn add_preferences(pod: &mut Pod, preferences: Vec<PreferredSchedulingTerm>) {
    if preferences.is_empty() {
        return;
    }
    let Some(spec) = pod.spec.as_mut() else {
        return;
    };

    let terms = spec
        .affinity
        .get_or_insert_with(Affinity::default)
        .node_affinity
        .get_or_insert_with(NodeAffinity::default)
        .preferred_during_scheduling_ignored_during_execution
        .get_or_insert_with(Vec::new);

    for preference in preferences {
        if !terms.contains(&preference) {
            terms.push(preference);
        }
    }
}
