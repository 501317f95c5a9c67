//! The path to handler registry of the admission webhook.
use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use axum::{Json, Router, routing::post};
use kube::{
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
};
use snafu::Snafu;
use tracing::{Instrument, debug, info, warn};

pub type Result<T, E = RegistryError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum RegistryError {
    #[snafu(display("handlers {existing:?} and {duplicate:?} are both registered at path {path:?}"))]
    DuplicatePath {
        path: String,
        existing: &'static str,
        duplicate: &'static str,
    },
}

/// Handles the admission requests sent to one path.
#[async_trait]
pub trait AdmissionHandler: Send + Sync {
    /// A short name of the handler, used in logs.
    fn name(&self) -> &'static str;

    async fn handle(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse;
}

type Gate = Box<dyn FnOnce() -> bool + Send>;

struct Registration {
    handler: Arc<dyn AdmissionHandler>,
    gate: Option<Gate>,
}

/// Collects handler registrations until the webhook starts.
#[derive(Default)]
pub struct RegistryBuilder {
    registrations: BTreeMap<String, Registration>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` at `path`. A missing leading `/` is added. Empty
    /// paths are skipped.
    pub fn register(self, path: &str, handler: Arc<dyn AdmissionHandler>) -> Result<Self> {
        self.insert(path, handler, None)
    }

    /// Like [`Self::register`], but the handler is only installed if `gate`
    /// returns `true` when the registry gets built.
    pub fn register_gated(
        self,
        path: &str,
        handler: Arc<dyn AdmissionHandler>,
        gate: impl FnOnce() -> bool + Send + 'static,
    ) -> Result<Self> {
        self.insert(path, handler, Some(Box::new(gate)))
    }

    fn insert(
        mut self,
        path: &str,
        handler: Arc<dyn AdmissionHandler>,
        gate: Option<Gate>,
    ) -> Result<Self> {
        if path.is_empty() {
            warn!(
                handler.name = handler.name(),
                "skipping handler registered without a path"
            );
            return Ok(self);
        }

        let path = normalize_path(path);
        if let Some(existing) = self.registrations.get(&path) {
            return DuplicatePathSnafu {
                path,
                existing: existing.handler.name(),
                duplicate: handler.name(),
            }
            .fail();
        }

        self.registrations
            .insert(path, Registration { handler, gate });
        Ok(self)
    }

    /// Evaluates every gate once and keeps the handlers which passed.
    pub fn build(self) -> Registry {
        let mut handlers = BTreeMap::new();

        for (path, Registration { handler, gate }) in self.registrations {
            if gate.is_some_and(|gate| !gate()) {
                info!(
                    handler.name = handler.name(),
                    handler.path = %path,
                    "handler is disabled"
                );
                continue;
            }

            debug!(
                handler.name = handler.name(),
                handler.path = %path,
                "registered handler"
            );
            handlers.insert(path, handler);
        }

        Registry { handlers }
    }
}

impl fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("paths", &self.registrations.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// The active handlers, keyed by path.
#[derive(Clone)]
pub struct Registry {
    handlers: BTreeMap<String, Arc<dyn AdmissionHandler>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn get(&self, path: &str) -> Option<&Arc<dyn AdmissionHandler>> {
        self.handlers.get(&normalize_path(path))
    }

    /// Binds every handler to a `POST` route at its path.
    pub fn into_router(self) -> Router {
        self.handlers
            .into_iter()
            .fold(Router::new(), |router, (path, handler)| {
                let handler_fn = move |Json(review): Json<AdmissionReview<DynamicObject>>| async move {
                    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
                        Ok(request) => request,
                        Err(err) => {
                            warn!(%err, "failed to convert admission review to request");
                            return Json(
                                AdmissionResponse::invalid(format!(
                                    "failed to convert to request: {err}"
                                ))
                                .into_review(),
                            );
                        }
                    };

                    let span = tracing::info_span!(
                        "handle_admission_request",
                        handler.name = handler.name(),
                        request.uid = %request.uid,
                        request.kind = %request.kind.kind,
                        request.namespace = request.namespace.as_deref().unwrap_or_default(),
                        request.name = %request.name,
                    );
                    let response = handler.handle(&request).instrument(span).await;

                    Json(response.into_review())
                };

                router.route(&path, post(handler_fn))
            })
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.handlers
                    .iter()
                    .map(|(path, handler)| (path, handler.name())),
            )
            .finish()
    }
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("/{path}")
    }
}
