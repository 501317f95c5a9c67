use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::{
    ByteString, api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::{Api, Client, api::PostParams};
use tracing::{debug, instrument};

use super::{CertArtifactStore, Result, StoreError};
use crate::CertificateArtifacts;

pub const SERVING_KEY_FILE_NAME: &str = "key.pem";
pub const SERVING_CERT_FILE_NAME: &str = "cert.pem";
pub const CA_KEY_FILE_NAME: &str = "ca-key.pem";
pub const CA_CERT_FILE_NAME: &str = "ca-cert.pem";

/// A [`CertArtifactStore`] backed by a single Kubernetes [`Secret`].
///
/// The bundle is stored under the same keys the PEM files are named after.
/// The `resourceVersion` of the Secret is used as store version, which lets
/// the API server reject concurrent replacements.
#[derive(Clone)]
pub struct SecretCertStore {
    api: Api<Secret>,
    namespace: String,
    secret_name: String,
}

impl SecretCertStore {
    pub fn new(client: Client, namespace: impl Into<String>, secret_name: impl Into<String>) -> Self {
        let namespace = namespace.into();

        Self {
            api: Api::namespaced(client, &namespace),
            namespace,
            secret_name: secret_name.into(),
        }
    }

    pub fn secret_name(&self) -> &str {
        &self.secret_name
    }

    fn to_secret(&self, artifacts: &CertificateArtifacts, resource_version: Option<&str>) -> Secret {
        let data = [
            (SERVING_KEY_FILE_NAME, &artifacts.serving_key),
            (SERVING_CERT_FILE_NAME, &artifacts.serving_cert),
            (CA_KEY_FILE_NAME, &artifacts.ca_key),
            (CA_CERT_FILE_NAME, &artifacts.ca_cert),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_owned(), ByteString(value.clone())))
        .collect::<BTreeMap<_, _>>();

        Secret {
            metadata: ObjectMeta {
                name: Some(self.secret_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: resource_version.map(ToOwned::to_owned),
                ..ObjectMeta::default()
            },
            data: Some(data),
            type_: Some("Opaque".to_owned()),
            ..Secret::default()
        }
    }

    fn api_error(&self, source: kube::Error) -> StoreError {
        StoreError::KubeApi {
            source,
            secret_name: self.secret_name.clone(),
        }
    }
}

/// Extracts the bundle from `secret`. Missing keys yield empty blobs.
fn artifacts_from_secret(secret: Secret) -> CertificateArtifacts {
    let mut data = secret.data.unwrap_or_default();
    let mut take = |key: &str| data.remove(key).map(|value| value.0).unwrap_or_default();

    CertificateArtifacts {
        serving_key: take(SERVING_KEY_FILE_NAME),
        serving_cert: take(SERVING_CERT_FILE_NAME),
        ca_key: take(CA_KEY_FILE_NAME),
        ca_cert: take(CA_CERT_FILE_NAME),
        store_version: secret.metadata.resource_version,
    }
}

fn status_code(error: &kube::Error) -> Option<u16> {
    match error {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

#[async_trait]
impl CertArtifactStore for SecretCertStore {
    #[instrument(name = "read_certificate_secret", skip(self), fields(secret.name = %self.secret_name))]
    async fn read(&self) -> Result<CertificateArtifacts> {
        match self.api.get(&self.secret_name).await {
            Ok(secret) => Ok(artifacts_from_secret(secret)),
            Err(err) if status_code(&err) == Some(404) => Err(StoreError::NotFound),
            Err(err) => Err(self.api_error(err)),
        }
    }

    #[instrument(name = "create_certificate_secret", skip(self, artifacts), fields(secret.name = %self.secret_name))]
    async fn create(&self, artifacts: &CertificateArtifacts) -> Result<CertificateArtifacts> {
        let secret = self.to_secret(artifacts, None);

        match self.api.create(&PostParams::default(), &secret).await {
            Ok(secret) => {
                debug!(
                    secret.resource_version = ?secret.metadata.resource_version,
                    "created certificate secret"
                );
                Ok(artifacts_from_secret(secret))
            }
            Err(err) if status_code(&err) == Some(409) => Err(StoreError::AlreadyExists),
            Err(err) => Err(self.api_error(err)),
        }
    }

    #[instrument(name = "replace_certificate_secret", skip(self, artifacts), fields(secret.name = %self.secret_name))]
    async fn overwrite(
        &self,
        artifacts: &CertificateArtifacts,
        version: Option<&str>,
    ) -> Result<CertificateArtifacts> {
        let secret = self.to_secret(artifacts, version);

        match self
            .api
            .replace(&self.secret_name, &PostParams::default(), &secret)
            .await
        {
            Ok(secret) => {
                debug!(
                    secret.resource_version = ?secret.metadata.resource_version,
                    "replaced certificate secret"
                );
                Ok(artifacts_from_secret(secret))
            }
            Err(err) if status_code(&err) == Some(409) => Err(StoreError::Conflict {
                expected_version: version.map(ToOwned::to_owned),
            }),
            Err(err) if status_code(&err) == Some(404) => Err(StoreError::NotFound),
            Err(err) => Err(self.api_error(err)),
        }
    }
}
