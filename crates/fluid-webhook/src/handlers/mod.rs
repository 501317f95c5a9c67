//! The admission handlers and the checks they share.
//!
//! Every handler first runs [`prepare`], which answers requests that must not
//! be mutated and decodes the others into a [`Mutation`]. After mutating the
//! decoded object, [`Mutation::respond`] computes the JSON patch which is sent
//! back to the API server.
use fluid_injector::{ENABLE_INJECTION_LABEL, INJECT_SIDECAR_DONE_LABEL, TargetObject};
use kube::{
    api::{DynamicObject, TypeMeta},
    core::admission::{AdmissionRequest, AdmissionResponse},
};
use serde_json::Value;
use tracing::{debug, info, warn};

pub mod fuse;
pub mod node_affinity;

pub use fuse::FuseInjectionHandler;
pub use node_affinity::NodeAffinityHandler;

pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_FORBIDDEN: u16 = 403;
pub const STATUS_INTERNAL_SERVER_ERROR: u16 = 500;

/// Settings every handler honors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AdmissionSettings {
    /// Global kill switch. Every request is allowed unchanged.
    pub disable_injection: bool,
}

/// The outcome of [`prepare`].
#[derive(Debug)]
pub enum Prepared {
    /// The request is answered without mutation.
    Respond(AdmissionResponse),

    Mutate(Box<Mutation>),
}

/// An object which passed the shared checks.
#[derive(Debug)]
pub struct Mutation {
    /// The decoded object. An empty namespace is replaced by the namespace
    /// of the request.
    pub target: TargetObject,

    /// The namespace the object lives in.
    pub namespace: String,

    baseline: Value,
    namespace_defaulted: bool,
}

impl Mutation {
    /// Answers the request with the difference between the decoded and the
    /// `mutated` object. No difference allows the request unchanged.
    pub fn respond(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        mutated: &TargetObject,
    ) -> AdmissionResponse {
        let mutated = match self.encode(mutated) {
            Ok(mutated) => mutated,
            Err(err) => {
                return error_response(
                    request,
                    STATUS_INTERNAL_SERVER_ERROR,
                    format!("failed to encode mutated object: {err}"),
                );
            }
        };

        let patch = json_patch::diff(&self.baseline, &mutated);
        if patch.0.is_empty() {
            debug!("object is unchanged");
            return AdmissionResponse::from(request);
        }

        debug!(patch.operations = patch.0.len(), "responding with patch");
        AdmissionResponse::from(request)
            .with_patch(patch)
            .unwrap_or_else(|err| {
                error_response(
                    request,
                    STATUS_INTERNAL_SERVER_ERROR,
                    format!("failed to serialize patch: {err}"),
                )
            })
    }

    /// Encodes `target`, undoing the namespace defaulting of [`prepare`].
    fn encode(&self, target: &TargetObject) -> Result<Value, fluid_injector::target::TargetError> {
        let mut value = target.to_value()?;

        if self.namespace_defaulted {
            if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
                metadata.remove("namespace");
            }
        }

        Ok(value)
    }
}

/// Runs the checks shared by all handlers, in this order:
///
/// 1. the global kill switch allows the request unchanged,
/// 2. an object namespace differing from the request namespace is denied,
/// 3. an empty object namespace is replaced by the request namespace,
/// 4. objects labeled `fluid.io/enable-injection=false` and objects labeled
///    `fluid.io/inject-sidecar-done=true` are allowed unchanged.
pub fn prepare(request: &AdmissionRequest<DynamicObject>, settings: &AdmissionSettings) -> Prepared {
    if settings.disable_injection {
        info!("injection is disabled globally, allowing unchanged");
        return Prepared::Respond(AdmissionResponse::from(request));
    }

    let Some(object) = &request.object else {
        debug!("request carries no object, allowing unchanged");
        return Prepared::Respond(AdmissionResponse::from(request));
    };

    let request_namespace = request.namespace.as_deref().unwrap_or_default();
    let object_namespace = object.metadata.namespace.as_deref().unwrap_or_default();

    if !object_namespace.is_empty() && object_namespace != request_namespace {
        warn!(
            object.namespace = object_namespace,
            "object namespace differs from request namespace"
        );
        return Prepared::Respond(error_response(
            request,
            STATUS_FORBIDDEN,
            format!(
                "object namespace {object_namespace:?} differs from request namespace {request_namespace:?}"
            ),
        ));
    }

    let namespace_defaulted = object_namespace.is_empty();
    let namespace = if namespace_defaulted {
        request_namespace
    } else {
        object_namespace
    };
    if namespace.is_empty() {
        return Prepared::Respond(error_response(
            request,
            STATUS_INTERNAL_SERVER_ERROR,
            "neither the object nor the request carries a namespace",
        ));
    }

    let mut object = object.clone();
    if object.types.is_none() {
        object.types = Some(type_meta(request));
    }
    object.metadata.namespace = Some(namespace.to_owned());

    let target = match serde_json::to_value(&object)
        .map_err(|err| err.to_string())
        .and_then(|value| TargetObject::from_value(value).map_err(|err| err.to_string()))
    {
        Ok(target) => target,
        Err(err) => {
            return Prepared::Respond(error_response(
                request,
                STATUS_BAD_REQUEST,
                format!("failed to decode object: {err}"),
            ));
        }
    };

    if target.label(ENABLE_INJECTION_LABEL) == Some("false") {
        info!("injection is disabled for this object, allowing unchanged");
        return Prepared::Respond(AdmissionResponse::from(request));
    }

    if target.label(INJECT_SIDECAR_DONE_LABEL) == Some("true") {
        info!("object is already injected, allowing unchanged");
        return Prepared::Respond(AdmissionResponse::from(request));
    }

    let mut mutation = Mutation {
        target,
        namespace: namespace.to_owned(),
        baseline: Value::Null,
        namespace_defaulted,
    };
    match mutation.encode(&mutation.target) {
        Ok(baseline) => mutation.baseline = baseline,
        Err(err) => {
            return Prepared::Respond(error_response(
                request,
                STATUS_INTERNAL_SERVER_ERROR,
                format!("failed to encode object: {err}"),
            ));
        }
    }

    Prepared::Mutate(Box::new(mutation))
}

/// A denied response carrying `code` as its HTTP-equivalent status.
pub fn error_response(
    request: &AdmissionRequest<DynamicObject>,
    code: u16,
    message: impl ToString,
) -> AdmissionResponse {
    let mut response = AdmissionResponse::from(request).deny(message);
    response.result.code = code;
    response
}

fn type_meta(request: &AdmissionRequest<DynamicObject>) -> TypeMeta {
    let kind = &request.kind;
    let api_version = if kind.group.is_empty() {
        kind.version.clone()
    } else {
        format!("{group}/{version}", group = kind.group, version = kind.version)
    };

    TypeMeta {
        api_version,
        kind: kind.kind.clone(),
    }
}
