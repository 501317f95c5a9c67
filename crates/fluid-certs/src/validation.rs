//! Validation of a [`CertificateArtifacts`] bundle.
//!
//! A bundle is valid for a DNS name at a point in time if
//!
//! - the serving certificate, serving key and CA certificate are present,
//! - the serving key belongs to the serving certificate,
//! - the CA certificate can act as a trust anchor,
//! - the serving certificate chains up to that anchor and is valid for the
//!   DNS name at the given time.
//!
//! Callers pass a point in the future to force an early rotation, see
//! [`ROTATION_HORIZON`].
use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use const_oid::db::rfc5912::{ID_EC_PUBLIC_KEY, RSA_ENCRYPTION};
use snafu::{ResultExt, Snafu, ensure};
use tokio_rustls::rustls::{
    RootCertStore,
    client::{WebPkiServerVerifier, danger::ServerCertVerifier},
    crypto::ring::default_provider,
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use x509_cert::{
    Certificate,
    der::{DecodePem, Encode},
    spki::{EncodePublicKey, ObjectIdentifier},
};

use crate::{
    CertificateArtifacts,
    keys::{CertificateKeypair, ecdsa, rsa},
};

/// Bundles which expire within this time span are treated as invalid.
pub const ROTATION_HORIZON: Duration = Duration::from_secs(183 * 24 * 60 * 60);

pub type Result<T, E = ValidationError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum ValidationError {
    #[snafu(display("the {artifact} is missing"))]
    MissingArtifact { artifact: &'static str },

    #[snafu(display("failed to parse the {artifact} from PEM"))]
    ParseCertificate {
        source: x509_cert::der::Error,
        artifact: &'static str,
    },

    #[snafu(display("failed to encode the {artifact} as DER"))]
    EncodeCertificate {
        source: x509_cert::der::Error,
        artifact: &'static str,
    },

    #[snafu(display("the serving key is not valid UTF-8"))]
    ServingKeyEncoding { source: std::str::Utf8Error },

    #[snafu(display("the serving key cannot be parsed as ECDSA key"))]
    ParseEcdsaServingKey { source: ecdsa::Error },

    #[snafu(display("the serving key cannot be parsed as RSA key"))]
    ParseRsaServingKey { source: rsa::Error },

    #[snafu(display("unsupported public key algorithm {oid}"))]
    UnsupportedKeyAlgorithm { oid: ObjectIdentifier },

    #[snafu(display("failed to encode public key"))]
    EncodePublicKey { source: x509_cert::spki::Error },

    #[snafu(display("the serving key does not belong to the serving certificate"))]
    KeyPairMismatch,

    #[snafu(display("the CA certificate cannot seed a trust pool"))]
    SeedTrustPool {
        source: tokio_rustls::rustls::Error,
    },

    #[snafu(display("failed to build certificate verifier"))]
    BuildVerifier {
        source: tokio_rustls::rustls::client::VerifierBuilderError,
    },

    #[snafu(display("{dns_name:?} is not a valid DNS name"))]
    InvalidDnsName {
        source: tokio_rustls::rustls::pki_types::InvalidDnsNameError,
        dns_name: String,
    },

    #[snafu(display("the serving certificate does not verify for {dns_name:?}"))]
    VerifyChain {
        source: tokio_rustls::rustls::Error,
        dns_name: String,
    },
}

/// Validates `artifacts` for `dns_name` at the point in time `at`.
pub fn validate(artifacts: &CertificateArtifacts, dns_name: &str, at: SystemTime) -> Result<()> {
    ensure!(
        !artifacts.serving_cert.is_empty(),
        MissingArtifactSnafu {
            artifact: "serving certificate"
        }
    );
    ensure!(
        !artifacts.serving_key.is_empty(),
        MissingArtifactSnafu {
            artifact: "serving key"
        }
    );
    ensure!(
        !artifacts.ca_cert.is_empty(),
        MissingArtifactSnafu {
            artifact: "CA certificate"
        }
    );

    let serving_cert =
        Certificate::from_pem(&artifacts.serving_cert).context(ParseCertificateSnafu {
            artifact: "serving certificate",
        })?;
    let serving_key = std::str::from_utf8(&artifacts.serving_key).context(ServingKeyEncodingSnafu)?;
    verify_key_pair(&serving_cert, serving_key)?;

    let ca_cert = Certificate::from_pem(&artifacts.ca_cert).context(ParseCertificateSnafu {
        artifact: "CA certificate",
    })?;
    let ca_der = ca_cert.to_der().context(EncodeCertificateSnafu {
        artifact: "CA certificate",
    })?;
    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(ca_der))
        .context(SeedTrustPoolSnafu)?;

    let serving_der = serving_cert.to_der().context(EncodeCertificateSnafu {
        artifact: "serving certificate",
    })?;
    verify_chain(roots, &CertificateDer::from(serving_der), dns_name, at)
}

/// Like [`validate`], but evaluated [`ROTATION_HORIZON`] from now.
pub fn validate_for_rotation(artifacts: &CertificateArtifacts, dns_name: &str) -> Result<()> {
    validate(artifacts, dns_name, SystemTime::now() + ROTATION_HORIZON)
}

/// Returns the `notAfter` timestamp of the serving certificate, if it can be
/// parsed.
pub fn serving_cert_not_after(artifacts: &CertificateArtifacts) -> Option<SystemTime> {
    let certificate = Certificate::from_pem(&artifacts.serving_cert).ok()?;
    Some(certificate.tbs_certificate.validity.not_after.to_system_time())
}

fn verify_key_pair(certificate: &Certificate, key_pem: &str) -> Result<()> {
    let spki = &certificate.tbs_certificate.subject_public_key_info;
    let oid = spki.algorithm.oid;

    let public_key_der = if oid == ID_EC_PUBLIC_KEY {
        public_key_der(&ecdsa::SigningKey::from_pkcs8_pem(key_pem).context(ParseEcdsaServingKeySnafu)?)?
    } else if oid == RSA_ENCRYPTION {
        public_key_der(&rsa::SigningKey::from_pkcs8_pem(key_pem).context(ParseRsaServingKeySnafu)?)?
    } else {
        return UnsupportedKeyAlgorithmSnafu { oid }.fail();
    };

    let certificate_public_key_der = spki.to_der().context(EncodeCertificateSnafu {
        artifact: "serving certificate public key",
    })?;

    ensure!(
        public_key_der == certificate_public_key_der,
        KeyPairMismatchSnafu
    );
    Ok(())
}

fn public_key_der<S>(key_pair: &S) -> Result<Vec<u8>>
where
    S: CertificateKeypair,
    <S::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    let document = key_pair
        .verifying_key()
        .to_public_key_der()
        .context(EncodePublicKeySnafu)?;

    Ok(document.as_bytes().to_vec())
}

fn verify_chain(
    roots: RootCertStore,
    end_entity: &CertificateDer<'_>,
    dns_name: &str,
    at: SystemTime,
) -> Result<()> {
    let verifier =
        WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::new(default_provider()))
            .build()
            .context(BuildVerifierSnafu)?;

    let server_name = ServerName::try_from(dns_name.to_owned()).context(InvalidDnsNameSnafu {
        dns_name,
    })?;
    let now = UnixTime::since_unix_epoch(at.duration_since(UNIX_EPOCH).unwrap_or_default());

    verifier
        .verify_server_cert(end_entity, &[], &server_name, &[], now)
        .context(VerifyChainSnafu { dns_name })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::CertGenerator;

    const DNS_NAME: &str = "fluid-pod-admission-webhook.fluid-system.svc";

    fn generate() -> CertificateArtifacts {
        CertGenerator::default()
            .generate(DNS_NAME)
            .expect("failed to generate bundle")
    }

    #[test]
    fn fresh_bundle_is_valid_for_rotation() {
        validate_for_rotation(&generate(), DNS_NAME).expect("fresh bundle must be valid");
    }

    #[rstest]
    #[case::serving_cert("serving certificate")]
    #[case::serving_key("serving key")]
    #[case::ca_cert("CA certificate")]
    fn missing_artifact(#[case] artifact: &str) {
        let mut artifacts = generate();
        match artifact {
            "serving certificate" => artifacts.serving_cert.clear(),
            "serving key" => artifacts.serving_key.clear(),
            _ => artifacts.ca_cert.clear(),
        }

        let err = validate_for_rotation(&artifacts, DNS_NAME).unwrap_err();
        assert!(
            matches!(err, ValidationError::MissingArtifact { artifact: missing } if missing == artifact)
        );
    }

    #[test]
    fn foreign_serving_key_is_rejected() {
        let artifacts = CertificateArtifacts {
            serving_key: generate().serving_key,
            ..generate()
        };

        let err = validate_for_rotation(&artifacts, DNS_NAME).unwrap_err();
        assert!(matches!(err, ValidationError::KeyPairMismatch));
    }

    #[test]
    fn foreign_ca_is_rejected() {
        let artifacts = CertificateArtifacts {
            ca_cert: generate().ca_cert,
            ..generate()
        };

        let err = validate_for_rotation(&artifacts, DNS_NAME).unwrap_err();
        assert!(matches!(err, ValidationError::VerifyChain { .. }));
    }

    #[test]
    fn garbage_ca_cannot_seed_trust_pool() {
        let artifacts = CertificateArtifacts {
            ca_cert: b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n".to_vec(),
            ..generate()
        };

        assert!(validate_for_rotation(&artifacts, DNS_NAME).is_err());
    }

    #[test]
    fn other_dns_name_is_rejected() {
        let err = validate_for_rotation(&generate(), "other.fluid-system.svc").unwrap_err();
        assert!(matches!(err, ValidationError::VerifyChain { .. }));
    }

    #[test]
    fn bundle_expiring_within_horizon_is_rejected() {
        let artifacts = CertGenerator::default()
            .with_validity(Duration::from_secs(30 * 24 * 60 * 60))
            .generate(DNS_NAME)
            .unwrap();

        validate(&artifacts, DNS_NAME, SystemTime::now()).expect("bundle is valid today");
        let err = validate_for_rotation(&artifacts, DNS_NAME).unwrap_err();
        assert!(matches!(err, ValidationError::VerifyChain { .. }));
    }
}
