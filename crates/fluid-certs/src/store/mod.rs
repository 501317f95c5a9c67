//! Persistence of [`CertificateArtifacts`].
//!
//! A store holds at most one bundle. All mutations use optimistic
//! concurrency: [`CertArtifactStore::create`] only succeeds if no bundle
//! exists yet and [`CertArtifactStore::overwrite`] only succeeds if the stored
//! version still matches the one the caller read.
use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use snafu::Snafu;

use crate::CertificateArtifacts;

mod memory;
mod secret;

pub use memory::InMemoryCertStore;
pub use secret::{
    CA_CERT_FILE_NAME, CA_KEY_FILE_NAME, SERVING_CERT_FILE_NAME, SERVING_KEY_FILE_NAME,
    SecretCertStore,
};

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("no certificate bundle stored"))]
    NotFound,

    #[snafu(display("a certificate bundle already exists"))]
    AlreadyExists,

    #[snafu(display("the stored certificate bundle changed since version {expected_version:?}"))]
    Conflict { expected_version: Option<String> },

    #[snafu(display("store operation did not finish within {timeout:?}"))]
    TimedOut { timeout: Duration },

    #[snafu(display("failed to access Secret {secret_name:?}"))]
    KubeApi {
        source: kube::Error,
        secret_name: String,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

/// The backing store of the certificate bundle.
///
/// Implementations return the stored bundle from every operation, with
/// [`CertificateArtifacts::store_version`] set to the version it is stored
/// under.
#[async_trait]
pub trait CertArtifactStore: Send + Sync {
    /// Reads the stored bundle, failing with [`StoreError::NotFound`] if
    /// there is none.
    async fn read(&self) -> Result<CertificateArtifacts>;

    /// Persists `artifacts` if no bundle exists yet, failing with
    /// [`StoreError::AlreadyExists`] otherwise.
    async fn create(&self, artifacts: &CertificateArtifacts) -> Result<CertificateArtifacts>;

    /// Replaces the stored bundle, failing with [`StoreError::Conflict`] if it
    /// is no longer stored under `version`.
    async fn overwrite(
        &self,
        artifacts: &CertificateArtifacts,
        version: Option<&str>,
    ) -> Result<CertificateArtifacts>;
}

#[async_trait]
impl<T> CertArtifactStore for Arc<T>
where
    T: CertArtifactStore + ?Sized,
{
    async fn read(&self) -> Result<CertificateArtifacts> {
        (**self).read().await
    }

    async fn create(&self, artifacts: &CertificateArtifacts) -> Result<CertificateArtifacts> {
        (**self).create(artifacts).await
    }

    async fn overwrite(
        &self,
        artifacts: &CertificateArtifacts,
        version: Option<&str>,
    ) -> Result<CertificateArtifacts> {
        (**self).overwrite(artifacts, version).await
    }
}

/// Runs a store operation, failing with [`StoreError::TimedOut`] once
/// `timeout` elapsed.
pub async fn with_deadline<T, F>(timeout: Duration, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, operation)
        .await
        .map_err(|_elapsed| StoreError::TimedOut { timeout })?
}
