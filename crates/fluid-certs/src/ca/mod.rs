//! Contains types and functions to generate the self-signed certificate
//! authority which signs the webhook serving certificate.
use std::time::Duration;

use x509_cert::{Certificate, name::RdnSequence, spki::EncodePublicKey};

use crate::{
    CertificatePair,
    keys::{CertificateKeypair, ecdsa, rsa},
};

mod ca_builder;
pub use ca_builder::*;

/// The default CA validity time span of 365 days.
pub const DEFAULT_CA_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// The amount of time `notBefore` is moved into the past to tolerate clock
/// skew between the webhook and the API server.
pub const DEFAULT_BACKDATE: Duration = Duration::from_secs(60 * 60);

/// The CA subject name.
pub const FLUID_CA_SUBJECT: &str = "CN=fluid-webhook-ca,O=fluid";

#[derive(Debug)]
pub struct CertificateAuthority<SK>
where
    SK: CertificateKeypair,
    <SK::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    certificate_pair: CertificatePair<SK>,
}

impl<SK> CertificateAuthority<SK>
where
    SK: CertificateKeypair,
    <SK::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    pub fn builder() -> CertificateAuthorityBuilderBuilder<'static, SK> {
        CertificateAuthorityBuilder::start_builder()
    }

    pub fn signing_key(&self) -> &SK::SigningKey {
        self.certificate_pair.key_pair().signing_key()
    }

    pub fn ca_cert(&self) -> &Certificate {
        &self.certificate_pair.certificate
    }

    pub fn certificate_pair(&self) -> &CertificatePair<SK> {
        &self.certificate_pair
    }

    /// The name certificates signed by this CA carry as their issuer.
    pub fn subject_name(&self) -> &RdnSequence {
        &self.ca_cert().tbs_certificate.subject
    }
}

impl CertificateAuthority<rsa::SigningKey> {
    pub fn builder_with_rsa() -> CertificateAuthorityBuilderBuilder<'static, rsa::SigningKey> {
        Self::builder()
    }
}

impl CertificateAuthority<ecdsa::SigningKey> {
    pub fn builder_with_ecdsa() -> CertificateAuthorityBuilderBuilder<'static, ecdsa::SigningKey> {
        Self::builder()
    }
}
