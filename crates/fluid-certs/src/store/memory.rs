use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CertArtifactStore, Result, StoreError};
use crate::CertificateArtifacts;

#[derive(Debug, Default)]
struct State {
    artifacts: Option<CertificateArtifacts>,
    version: u64,
    writes: u64,
}

/// A process-local [`CertArtifactStore`].
///
/// Versions are a counter which increments with every successful write.
#[derive(Debug, Default)]
pub struct InMemoryCertStore {
    state: Mutex<State>,
}

impl InMemoryCertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store which already holds `artifacts`.
    pub fn with_artifacts(mut artifacts: CertificateArtifacts) -> Self {
        artifacts.store_version = Some("1".to_owned());

        Self {
            state: Mutex::new(State {
                artifacts: Some(artifacts),
                version: 1,
                writes: 0,
            }),
        }
    }

    /// Returns how many successful `create` and `overwrite` calls happened.
    pub async fn writes(&self) -> u64 {
        self.state.lock().await.writes
    }
}

impl State {
    fn store(&mut self, artifacts: &CertificateArtifacts) -> CertificateArtifacts {
        self.version += 1;
        self.writes += 1;

        let stored = CertificateArtifacts {
            store_version: Some(self.version.to_string()),
            ..artifacts.clone()
        };
        self.artifacts = Some(stored.clone());

        stored
    }
}

#[async_trait]
impl CertArtifactStore for InMemoryCertStore {
    async fn read(&self) -> Result<CertificateArtifacts> {
        self.state
            .lock()
            .await
            .artifacts
            .clone()
            .ok_or(StoreError::NotFound)
    }

    async fn create(&self, artifacts: &CertificateArtifacts) -> Result<CertificateArtifacts> {
        let mut state = self.state.lock().await;
        if state.artifacts.is_some() {
            return Err(StoreError::AlreadyExists);
        }

        Ok(state.store(artifacts))
    }

    async fn overwrite(
        &self,
        artifacts: &CertificateArtifacts,
        version: Option<&str>,
    ) -> Result<CertificateArtifacts> {
        let mut state = self.state.lock().await;
        let stored_version = match &state.artifacts {
            Some(stored) => stored.store_version.as_deref(),
            None => return Err(StoreError::NotFound),
        };

        if stored_version != version {
            return Err(StoreError::Conflict {
                expected_version: version.map(ToOwned::to_owned),
            });
        }

        Ok(state.store(artifacts))
    }
}
