use std::sync::Arc;

use async_trait::async_trait;
use snafu::Snafu;
use tracing::{debug, instrument};

use crate::{
    NamespacedName,
    cache::{CacheConfig, TtlCache},
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LookupError {
    #[snafu(display("failed to look up persistent volume claim {claim}"))]
    LookupClaim {
        source: kube::Error,
        claim: NamespacedName,
    },

    #[snafu(display("failed to look up {kind} {object}"))]
    LookupObject {
        source: kube::Error,
        kind: &'static str,
        object: NamespacedName,
    },

    #[snafu(display("{kind} {object} does not exist"))]
    MissingObject {
        kind: &'static str,
        object: NamespacedName,
    },

    #[snafu(display("{kind} {object} is malformed: {reason}"))]
    MalformedObject {
        kind: &'static str,
        object: NamespacedName,
        reason: String,
    },
}

/// The runtime serving the dataset a persistent volume claim is bound to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeInfo {
    pub dataset: NamespacedName,

    /// The runtime kind, for example `alluxio` or `juicefs`.
    pub runtime_type: String,

    /// Whether the runtime's fuse runs globally on the nodes instead of as a
    /// sidecar.
    pub global_fuse: bool,

    /// UID of the claim at the time this information was resolved.
    pub claim_uid: String,
}

/// Resolves persistent volume claims to the dataset runtime they are bound to.
#[async_trait]
pub trait DatasetResolver: Send + Sync {
    /// Returns the UID of the live claim, [`None`] if it does not exist.
    async fn claim_uid(&self, namespace: &str, claim: &str) -> Result<Option<String>, LookupError>;

    /// Returns the runtime of the dataset `claim` is bound to, [`None`] if
    /// the claim is not backed by a dataset.
    async fn resolve(&self, namespace: &str, claim: &str) -> Result<Option<RuntimeInfo>, LookupError>;
}

#[async_trait]
impl<T> DatasetResolver for Arc<T>
where
    T: DatasetResolver + ?Sized,
{
    async fn claim_uid(&self, namespace: &str, claim: &str) -> Result<Option<String>, LookupError> {
        (**self).claim_uid(namespace, claim).await
    }

    async fn resolve(&self, namespace: &str, claim: &str) -> Result<Option<RuntimeInfo>, LookupError> {
        (**self).resolve(namespace, claim).await
    }
}

/// Caches [`RuntimeInfo`] per claim.
///
/// An entry is only handed out while the UID it was resolved for still
/// matches the live claim. A claim which got deleted and re-created under the
/// same name therefore never sees the runtime of its predecessor.
#[derive(Debug)]
pub struct RuntimeInfoCache {
    cache: TtlCache<NamespacedName, RuntimeInfo>,
}

impl RuntimeInfoCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            cache: TtlCache::new("runtime-info", config),
        }
    }

    pub fn get(&self, claim: &NamespacedName, live_uid: &str) -> Option<RuntimeInfo> {
        let info = self.cache.get(claim)?;
        if info.claim_uid == live_uid {
            return Some(info);
        }

        debug!(
            claim = %claim,
            claim.cached_uid = %info.claim_uid,
            claim.live_uid = live_uid,
            "cached runtime info belongs to a previous claim, purging"
        );
        self.cache.remove(claim);

        None
    }

    pub fn add(&self, claim: NamespacedName, info: RuntimeInfo) -> bool {
        self.cache.add(claim, info)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// A [`DatasetResolver`] which consults a [`RuntimeInfoCache`] first.
///
/// Without a cache every lookup goes to the inner resolver.
#[derive(Debug)]
pub struct CachedDatasetResolver<R> {
    inner: R,
    cache: Option<RuntimeInfoCache>,
}

impl<R> CachedDatasetResolver<R> {
    pub fn new(inner: R, cache: Option<RuntimeInfoCache>) -> Self {
        Self { inner, cache }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn cache(&self) -> Option<&RuntimeInfoCache> {
        self.cache.as_ref()
    }
}

#[async_trait]
impl<R> DatasetResolver for CachedDatasetResolver<R>
where
    R: DatasetResolver,
{
    async fn claim_uid(&self, namespace: &str, claim: &str) -> Result<Option<String>, LookupError> {
        self.inner.claim_uid(namespace, claim).await
    }

    #[instrument(name = "resolve_runtime_info", skip(self))]
    async fn resolve(&self, namespace: &str, claim: &str) -> Result<Option<RuntimeInfo>, LookupError> {
        let Some(cache) = &self.cache else {
            return self.inner.resolve(namespace, claim).await;
        };

        let Some(live_uid) = self.inner.claim_uid(namespace, claim).await? else {
            debug!("claim does not exist");
            return Ok(None);
        };

        let key = NamespacedName::new(namespace, claim);
        if let Some(info) = cache.get(&key, &live_uid) {
            debug!("runtime info cache hit");
            return Ok(Some(info));
        }

        let info = self.inner.resolve(namespace, claim).await?;
        if let Some(info) = info.as_ref().filter(|info| info.claim_uid == live_uid) {
            cache.add(key, info.clone());
        }

        Ok(info)
    }
}
