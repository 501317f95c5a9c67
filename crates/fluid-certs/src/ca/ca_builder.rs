use std::time::{Duration, SystemTime};

use bon::Builder;
use rsa::pkcs8::EncodePublicKey;
use snafu::{ResultExt, Snafu};
use tracing::{debug, instrument};
use x509_cert::{
    builder::{Builder, CertificateBuilder, Profile},
    der::{DecodePem, referenced::OwnedToRef},
    ext::pkix::{
        AuthorityKeyIdentifier, BasicConstraints, KeyUsage, KeyUsages, SubjectKeyIdentifier,
    },
    name::Name,
    serial_number::SerialNumber,
    spki::SubjectPublicKeyInfoOwned,
    time::{Time, Validity},
};

use super::CertificateAuthority;
use crate::{
    CertificatePair, PEM_LINE_ENDING,
    ca::{DEFAULT_BACKDATE, DEFAULT_CA_VALIDITY, FLUID_CA_SUBJECT},
    keys::CertificateKeypair,
};

/// Defines all error variants which can occur when creating a CA
#[derive(Debug, Snafu)]
pub enum CreateCertificateAuthorityError<E>
where
    E: std::error::Error + 'static,
{
    #[snafu(display("failed to compute validity window"))]
    ParseValidity { source: x509_cert::der::Error },

    #[snafu(display("failed to parse \"{subject}\" as subject"))]
    ParseSubject {
        source: x509_cert::der::Error,
        subject: String,
    },

    #[snafu(display("failed to create signing key pair"))]
    CreateSigningKeyPair { source: E },

    #[snafu(display("failed to serialize public key as PEM"))]
    SerializePublicKey { source: x509_cert::spki::Error },

    #[snafu(display("failed to decode SPKI from PEM"))]
    DecodeSpkiFromPem { source: x509_cert::der::Error },

    #[snafu(display("failed to derive key identifier from SPKI"))]
    DeriveKeyIdentifier { source: x509_cert::der::Error },

    #[snafu(display("failed to create certificate builder"))]
    CreateCertificateBuilder { source: x509_cert::builder::Error },

    #[snafu(display("failed to add certificate extension"))]
    AddCertificateExtension { source: x509_cert::builder::Error },

    #[snafu(display("failed to build certificate"))]
    BuildCertificate { source: x509_cert::builder::Error },
}

/// This builder builds certificate authorities of type [`CertificateAuthority`].
///
/// Defaults:
///
/// - a validity of [`DEFAULT_CA_VALIDITY`], with `notBefore` moved
///   [`DEFAULT_BACKDATE`] into the past
/// - a subject of [`FLUID_CA_SUBJECT`]
/// - a randomly generated serial number
/// - a freshly generated key pair, the algorithm is chosen by the generic
///   [`CertificateKeypair`] type
///
/// ```no_run
/// use fluid_certs::ca::CertificateAuthority;
///
/// let ca = CertificateAuthority::builder_with_ecdsa()
///     .build()
///     .expect("failed to build CA");
/// ```
#[derive(Builder)]
#[builder(start_fn = start_builder, finish_fn = finish_builder)]
pub struct CertificateAuthorityBuilder<'a, SKP>
where
    SKP: CertificateKeypair,
    <SKP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    /// Subject of the certificate authority, usually starts with `CN=`.
    #[builder(default = FLUID_CA_SUBJECT)]
    subject: &'a str,

    /// Lifetime of the certificate, counted from now.
    #[builder(default = DEFAULT_CA_VALIDITY)]
    validity: Duration,

    /// How far `notBefore` lies in the past.
    #[builder(default = DEFAULT_BACKDATE)]
    backdate: Duration,

    /// Cryptographic keypair used to sign the CA and the serving certificate.
    ///
    /// If not specified a random keypair will be generated.
    signing_key_pair: Option<SKP>,
}

impl<SKP, S> CertificateAuthorityBuilderBuilder<'_, SKP, S>
where
    SKP: CertificateKeypair,
    <SKP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
    S: certificate_authority_builder_builder::IsComplete,
{
    /// Convenience function to avoid calling `builder().finish_builder().build()`
    pub fn build(
        self,
    ) -> Result<CertificateAuthority<SKP>, CreateCertificateAuthorityError<SKP::Error>> {
        self.finish_builder().build()
    }
}

impl<SKP> CertificateAuthorityBuilder<'_, SKP>
where
    SKP: CertificateKeypair,
    <SKP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    #[instrument(
        name = "build_certificate_authority",
        skip(self),
        fields(subject = self.subject),
    )]
    pub fn build(
        self,
    ) -> Result<CertificateAuthority<SKP>, CreateCertificateAuthorityError<SKP::Error>> {
        let validity = validity_window(SystemTime::now(), self.backdate, self.validity)
            .context(ParseValiditySnafu)?;
        let subject: Name = self.subject.parse().context(ParseSubjectSnafu {
            subject: self.subject,
        })?;
        let signing_key_pair = match self.signing_key_pair {
            Some(signing_key_pair) => signing_key_pair,
            None => SKP::new().context(CreateSigningKeyPairSnafu)?,
        };

        let serial_number = SerialNumber::from(rand::random::<u64>());

        let spki_pem = signing_key_pair
            .verifying_key()
            .to_public_key_pem(PEM_LINE_ENDING)
            .context(SerializePublicKeySnafu)?;

        let spki = SubjectPublicKeyInfoOwned::from_pem(spki_pem.as_bytes())
            .context(DecodeSpkiFromPemSnafu)?;

        // Both key identifiers use the 160-bit SHA-1 hash of the subject
        // public key, see RFC 5280, section 4.2.1.2. The CA is self-signed,
        // so they carry the same value.
        let ski = SubjectKeyIdentifier::try_from(spki.owned_to_ref())
            .context(DeriveKeyIdentifierSnafu)?;
        let aki = AuthorityKeyIdentifier::try_from(spki.owned_to_ref())
            .context(DeriveKeyIdentifierSnafu)?;

        debug!(
            ca.subject = %subject,
            ca.not_after = %validity.not_after,
            ca.not_before = %validity.not_before,
            ca.serial = %serial_number,
            ca.public_key.algorithm = SKP::algorithm_name(),
            ca.public_key.size = SKP::key_size(),
            "creating certificate authority"
        );
        let signer = signing_key_pair.signing_key();

        // The manual profile adds no extensions on its own, which gives us
        // exact control over the key usage bits below.
        let mut builder = CertificateBuilder::new(
            Profile::Manual { issuer: None },
            serial_number,
            validity,
            subject,
            spki,
            signer,
        )
        .context(CreateCertificateBuilderSnafu)?;

        builder
            .add_extension(&BasicConstraints {
                ca: true,
                path_len_constraint: None,
            })
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&KeyUsage(
                KeyUsages::KeyCertSign | KeyUsages::DigitalSignature,
            ))
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&ski)
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&aki)
            .context(AddCertificateExtensionSnafu)?;

        let certificate = builder
            .build::<SKP::Signature>()
            .context(BuildCertificateSnafu)?;

        Ok(CertificateAuthority {
            certificate_pair: CertificatePair {
                certificate,
                key_pair: signing_key_pair,
            },
        })
    }
}

/// Returns the window `[now - backdate, now + lifetime]`.
pub(crate) fn validity_window(
    now: SystemTime,
    backdate: Duration,
    lifetime: Duration,
) -> Result<Validity, x509_cert::der::Error> {
    let not_before = now.checked_sub(backdate).unwrap_or(now);

    Ok(Validity {
        not_before: Time::try_from(not_before)?,
        not_after: Time::try_from(now + lifetime)?,
    })
}

#[cfg(test)]
mod tests {
    use const_oid::db::rfc5280::ID_CE_KEY_USAGE;
    use x509_cert::{certificate::TbsCertificateInner, der::Decode};

    use super::*;
    use crate::keys::rsa;

    #[test]
    fn minimal_ca() {
        let ca = CertificateAuthority::builder_with_ecdsa()
            .build()
            .expect("failed to build CA");

        assert_ca_cert_attributes(
            &ca.ca_cert().tbs_certificate,
            FLUID_CA_SUBJECT,
            DEFAULT_CA_VALIDITY + DEFAULT_BACKDATE,
        );
    }

    #[test]
    fn customized_ca() {
        let ca = CertificateAuthority::builder()
            .subject("CN=Test")
            .signing_key_pair(rsa::SigningKey::new().unwrap())
            .validity(Duration::from_secs(13 * 24 * 60 * 60))
            .backdate(Duration::ZERO)
            .build()
            .expect("failed to build CA");

        assert_ca_cert_attributes(
            &ca.ca_cert().tbs_certificate,
            "CN=Test",
            Duration::from_secs(13 * 24 * 60 * 60),
        );
    }

    #[test]
    fn ca_is_self_issued_and_may_sign() {
        let ca = CertificateAuthority::builder_with_ecdsa()
            .build()
            .expect("failed to build CA");
        let tbs = &ca.ca_cert().tbs_certificate;

        assert_eq!(tbs.issuer, tbs.subject);

        let extensions = tbs.extensions.as_ref().expect("CA had no extensions");
        let key_usage = extensions
            .iter()
            .find(|ext| ext.extn_id == ID_CE_KEY_USAGE)
            .expect("CA had no key usage extension");
        let key_usage = KeyUsage::from_der(key_usage.extn_value.as_bytes()).unwrap();

        assert!(key_usage.key_cert_sign());
        assert!(key_usage.digital_signature());
        assert!(!key_usage.key_encipherment());
    }

    fn assert_ca_cert_attributes(ca_cert: &TbsCertificateInner, subject: &str, span: Duration) {
        assert_eq!(ca_cert.subject, subject.parse().unwrap());

        let not_before = ca_cert.validity.not_before.to_system_time();
        let not_after = ca_cert.validity.not_after.to_system_time();
        assert_eq!(
            not_after
                .duration_since(not_before)
                .expect("Failed to calculate duration between notBefore and notAfter"),
            span
        );
    }
}
