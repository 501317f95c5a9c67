use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;

use crate::{
    InjectionTemplate, NamespacedName,
    cache::{CacheConfig, RuntimeInfo, TtlCache, runtime_info::LookupError},
};

/// Label which keeps the runtime's cache directories in the fuse sidecar.
pub const CACHE_DIR_OPTION_LABEL: &str = "cachedir.sidecar.fluid.io/inject";

/// Label which requests an unprivileged fuse sidecar.
pub const UNPRIVILEGED_OPTION_LABEL: &str = "unprivileged.sidecar.fluid.io/inject";

/// Separates the claim from the option fingerprint in template cache keys.
/// Neither Kubernetes names nor fingerprints contain it.
const KEY_SEPARATOR: char = '#';

/// Per-object options which change the rendered fuse template.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FuseSidecarOptions {
    pub enable_cache_dir: bool,
    pub unprivileged_sidecar: bool,
}

impl FuseSidecarOptions {
    pub fn from_labels(labels: Option<&BTreeMap<String, String>>) -> Self {
        let enabled = |key: &str| labels.and_then(|labels| labels.get(key)).is_some_and(|value| value == "true");

        Self {
            enable_cache_dir: enabled(CACHE_DIR_OPTION_LABEL),
            unprivileged_sidecar: enabled(UNPRIVILEGED_OPTION_LABEL),
        }
    }

    /// A stable textual form of the options.
    pub fn fingerprint(&self) -> String {
        format!(
            "cachedir={cache_dir},unprivileged={unprivileged}",
            cache_dir = self.enable_cache_dir,
            unprivileged = self.unprivileged_sidecar
        )
    }
}

/// Renders the cache key of the template for `claim` and `options`.
pub fn fuse_template_key(claim: &NamespacedName, options: &FuseSidecarOptions) -> String {
    format!("{claim}{KEY_SEPARATOR}{fingerprint}", fingerprint = options.fingerprint())
}

/// Renders the fuse template of a dataset runtime.
#[async_trait]
pub trait TemplateProvider: Send + Sync {
    async fn template(
        &self,
        claim: &NamespacedName,
        runtime: &RuntimeInfo,
        options: &FuseSidecarOptions,
    ) -> Result<InjectionTemplate, LookupError>;
}

/// Caches rendered templates per claim and option set.
#[derive(Debug)]
pub struct FuseTemplateCache {
    cache: TtlCache<String, Arc<InjectionTemplate>>,
}

impl FuseTemplateCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            cache: TtlCache::new("fuse-template", config),
        }
    }

    pub fn get(&self, claim: &NamespacedName, options: &FuseSidecarOptions) -> Option<Arc<InjectionTemplate>> {
        self.cache.get(&fuse_template_key(claim, options))
    }

    pub fn add(&self, claim: &NamespacedName, options: &FuseSidecarOptions, template: Arc<InjectionTemplate>) -> bool {
        self.cache.add(fuse_template_key(claim, options), template)
    }

    /// Returns the cached template, rendering and caching it through
    /// `provider` on a miss. Concurrent misses may render twice, the first
    /// stored template wins.
    pub async fn get_or_render(
        &self,
        provider: &dyn TemplateProvider,
        claim: &NamespacedName,
        runtime: &RuntimeInfo,
        options: &FuseSidecarOptions,
    ) -> Result<Arc<InjectionTemplate>, LookupError> {
        if let Some(template) = self.get(claim, options) {
            return Ok(template);
        }

        let template = Arc::new(provider.template(claim, runtime, options).await?);
        self.add(claim, options, Arc::clone(&template));

        Ok(self.get(claim, options).unwrap_or(template))
    }
}
