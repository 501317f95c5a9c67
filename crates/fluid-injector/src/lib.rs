//! Fuse sidecar injection for Fluid.
//!
//! The [`InjectionEngine`] mutates a [`TargetObject`] according to an
//! [`InjectionTemplate`]: it prepends the fuse container, rewrites the dataset
//! volumes and appends the volumes the sidecar needs. Well-known workload kinds
//! are accessed through their typed pod spec, every other kind is searched
//! structurally by the [`ObjectFieldResolver`](resolver::ObjectFieldResolver).
//!
//! The [`cache`] module provides the bounded TTL caches which keep per-claim
//! runtime information and rendered templates around between admission
//! requests.
use std::fmt;

pub mod cache;
pub mod engine;
pub mod resolver;
pub mod target;
pub mod template;

// Selected re-exports
pub use crate::{
    engine::{ClaimVolume, InjectError, InjectionEngine},
    resolver::ResolveOptions,
    target::TargetObject,
    template::InjectionTemplate,
};

/// Annotation which activates sidecar injection for an object.
pub const INJECT_ANNOTATION: &str = "serverless.fluid.io/inject";

/// Name of the injected fuse container. Containers named like this, or with
/// this prefix, mark an object as already injected.
pub const FUSE_CONTAINER_NAME: &str = "fluid-fuse";

/// Label which opts an object out of any mutation when set to `false`.
pub const ENABLE_INJECTION_LABEL: &str = "fluid.io/enable-injection";

/// Label which marks an object as completely mutated when set to `true`.
pub const INJECT_SIDECAR_DONE_LABEL: &str = "fluid.io/inject-sidecar-done";

/// A namespaced reference, rendered as `namespace/name`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{namespace}/{name}", namespace = self.namespace, name = self.name)
    }
}
