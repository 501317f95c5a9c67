//! Keeps a valid certificate bundle in the backing store.
use std::time::Duration;

use snafu::{ResultExt, Snafu, ensure};
use tracing::{debug, info, instrument, warn};

use crate::{
    CertGenerator, CertificateArtifacts,
    artifacts::GenerateError,
    store::{CertArtifactStore, StoreError, with_deadline},
    validation::validate_for_rotation,
};

/// The deadline applied to every single store operation if none is
/// configured.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(10);

pub type Result<T, E = EnsureCertError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum EnsureCertError {
    #[snafu(display("the DNS name must not be empty"))]
    EmptyDnsName,

    #[snafu(display("failed to read certificate bundle from store"))]
    ReadStore { source: StoreError },

    #[snafu(display("failed to persist new certificate bundle"))]
    CreateInStore { source: StoreError },

    #[snafu(display("failed to read certificate bundle persisted by a concurrent writer"))]
    RereadStore { source: StoreError },

    #[snafu(display("failed to replace invalid certificate bundle in store"))]
    OverwriteStore { source: StoreError },

    #[snafu(display("failed to generate certificate bundle"))]
    GenerateArtifacts { source: GenerateError },

    #[snafu(display("failed to run certificate generation in blocking thread"))]
    JoinGenerateTask { source: tokio::task::JoinError },
}

impl EnsureCertError {
    /// Returns `true` if a store operation exceeded its deadline.
    pub fn is_timed_out(&self) -> bool {
        match self {
            Self::ReadStore { source }
            | Self::CreateInStore { source }
            | Self::RereadStore { source }
            | Self::OverwriteStore { source } => source.is_timed_out(),
            _ => false,
        }
    }
}

/// Guarantees that the store holds a bundle which stays valid for the
/// webhook DNS name for at least the
/// [rotation horizon](crate::validation::ROTATION_HORIZON).
///
/// The manager never retries. Callers decide whether and when to call
/// [`Self::ensure_cert`] again.
#[derive(Debug)]
pub struct CertificateLifecycleManager<S> {
    store: S,
    generator: CertGenerator,
    store_timeout: Duration,
}

impl<S> CertificateLifecycleManager<S>
where
    S: CertArtifactStore,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            generator: CertGenerator::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_generator(mut self, generator: CertGenerator) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns a valid bundle for `dns_name` and whether the store content
    /// was changed to provide it.
    ///
    /// A missing bundle is generated and created. If a concurrent writer
    /// created one first, that bundle is used instead. A bundle failing
    /// validation is regenerated and replaced using its store version.
    #[instrument(name = "ensure_certificate", skip(self), fields(certificate.dns_name = dns_name))]
    pub async fn ensure_cert(&self, dns_name: &str) -> Result<(CertificateArtifacts, bool)> {
        ensure!(!dns_name.is_empty(), EmptyDnsNameSnafu);

        let (artifacts, created) = self.create_if_not_exists(dns_name).await?;

        match validate_for_rotation(&artifacts, dns_name) {
            Ok(()) => {
                debug!(
                    store.version = ?artifacts.store_version,
                    "certificate bundle is valid"
                );
                Ok((artifacts, created))
            }
            Err(reason) => {
                info!(
                    store.version = ?artifacts.store_version,
                    reason = %reason,
                    "certificate bundle is invalid, replacing it"
                );

                let fresh = self.generate(dns_name).await?;
                let stored = with_deadline(
                    self.store_timeout,
                    self.store
                        .overwrite(&fresh, artifacts.store_version.as_deref()),
                )
                .await
                .context(OverwriteStoreSnafu)?;

                Ok((stored, true))
            }
        }
    }

    async fn create_if_not_exists(&self, dns_name: &str) -> Result<(CertificateArtifacts, bool)> {
        match with_deadline(self.store_timeout, self.store.read()).await {
            Ok(artifacts) => return Ok((artifacts, false)),
            Err(StoreError::NotFound) => {
                debug!("no certificate bundle stored yet, generating one");
            }
            Err(source) => return Err(EnsureCertError::ReadStore { source }),
        }

        let fresh = self.generate(dns_name).await?;
        match with_deadline(self.store_timeout, self.store.create(&fresh)).await {
            Ok(stored) => Ok((stored, true)),
            Err(StoreError::AlreadyExists) => {
                warn!("certificate bundle was created concurrently, using the stored one");
                let stored = with_deadline(self.store_timeout, self.store.read())
                    .await
                    .context(RereadStoreSnafu)?;

                Ok((stored, true))
            }
            Err(source) => Err(EnsureCertError::CreateInStore { source }),
        }
    }

    async fn generate(&self, dns_name: &str) -> Result<CertificateArtifacts> {
        let generator = self.generator;
        let dns_name = dns_name.to_owned();

        // Key generation can take a while, especially for RSA
        tokio::task::spawn_blocking(move || generator.generate(&dns_name))
            .await
            .context(JoinGenerateTaskSnafu)?
            .context(GenerateArtifactsSnafu)
    }
}
