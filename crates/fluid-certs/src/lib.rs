//! Certificate lifecycle for the Fluid admission webhook.
//!
//! The webhook serves HTTPS using a self-issued identity: a CA which lives
//! next to the serving certificate it signed. This crate provides
//!
//! - the [key](keys) and [CA](ca) primitives to generate such bundles,
//! - [`CertificateArtifacts`], the PEM-encoded bundle as it is persisted,
//! - [`validation`] of a bundle against the DNS name the webhook is reached at,
//! - the [`CertArtifactStore`](store::CertArtifactStore) contract plus a
//!   Kubernetes Secret and an in-memory implementation,
//! - the [`CertificateLifecycleManager`] which ties all of the above together,
//! - a [writer](files) which places the bundle on disk for the TLS server.
//!
//! ## References
//!
//! - <https://datatracker.ietf.org/doc/html/rfc5280>
//! - <https://github.com/zmap/zlint>
use p256::pkcs8::{EncodePrivateKey, LineEnding};
use snafu::{ResultExt, Snafu};
use x509_cert::{Certificate, der::EncodePem, spki::EncodePublicKey};

use crate::keys::CertificateKeypair;

pub mod artifacts;
pub mod ca;
pub mod files;
pub mod keys;
pub mod manager;
pub mod store;
pub mod validation;

mod cert_builder;

// Selected re-exports
pub use crate::{
    artifacts::{CertGenerator, CertificateArtifacts},
    cert_builder::{CreateCertificateError, LeafCertificateBuilder},
    manager::CertificateLifecycleManager,
};

/// The line ending used for every PEM document produced by this crate.
pub const PEM_LINE_ENDING: LineEnding = LineEnding::LF;

/// Error variants which can be encountered when encoding a [`CertificatePair`].
#[derive(Debug, Snafu)]
pub enum CertificatePairError {
    #[snafu(display("failed to serialize certificate as PEM"))]
    SerializeCertificate { source: x509_cert::der::Error },

    #[snafu(display("failed to serialize private key as PKCS8 PEM"))]
    SerializePrivateKey { source: p256::pkcs8::Error },
}

/// Contains the certificate and the signing / embedded key pair.
///
/// A [`CertificateAuthority`](crate::ca::CertificateAuthority) uses this
/// struct to store the key pair which signs the CA itself and the serving
/// certificate. The serving certificate uses it to store its bound key pair.
#[derive(Debug)]
pub struct CertificatePair<S>
where
    S: CertificateKeypair,
    <S::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    certificate: Certificate,
    key_pair: S,
}

impl<S> CertificatePair<S>
where
    S: CertificateKeypair,
    <S::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    /// Returns a reference to the [`Certificate`].
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Returns a reference to the (signing) key pair.
    pub fn key_pair(&self) -> &S {
        &self.key_pair
    }

    pub fn certificate_pem(&self) -> Result<Vec<u8>, CertificatePairError> {
        let pem = self
            .certificate
            .to_pem(PEM_LINE_ENDING)
            .context(SerializeCertificateSnafu)?;

        Ok(pem.into_bytes())
    }

    pub fn private_key_pem(&self) -> Result<Vec<u8>, CertificatePairError> {
        let pem = self
            .key_pair
            .signing_key()
            .to_pkcs8_pem(PEM_LINE_ENDING)
            .context(SerializePrivateKeySnafu)?;

        Ok(pem.as_bytes().to_vec())
    }
}

/// Supported private key types, currently [RSA](crate::keys::rsa) and
/// [ECDSA](crate::keys::ecdsa).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum PrivateKeyType {
    #[default]
    Ecdsa,
    Rsa,
}
