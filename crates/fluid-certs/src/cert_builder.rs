use std::time::{Duration, SystemTime};

use bon::Builder;
use const_oid::db::rfc5280::ID_KP_SERVER_AUTH;
use rsa::pkcs8::EncodePublicKey;
use snafu::{ResultExt, Snafu, ensure};
use tracing::{debug, instrument};
use x509_cert::{
    builder::{Builder, Profile},
    der::{DecodePem, asn1::Ia5String, referenced::OwnedToRef},
    ext::pkix::{
        AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, KeyUsages,
        SubjectAltName, name::GeneralName,
    },
    name::Name,
    serial_number::SerialNumber,
    spki::SubjectPublicKeyInfoOwned,
};

use crate::{
    CertificatePair, PEM_LINE_ENDING,
    ca::{CertificateAuthority, DEFAULT_BACKDATE, DEFAULT_CA_VALIDITY, validity_window},
    keys::CertificateKeypair,
};

/// Defines all error variants which can occur when creating a serving certificate
#[derive(Debug, Snafu)]
pub enum CreateCertificateError<E>
where
    E: std::error::Error + 'static,
{
    #[snafu(display("the DNS name must not be empty"))]
    EmptyDnsName,

    #[snafu(display("failed to compute validity window"))]
    ParseValidity { source: x509_cert::der::Error },

    #[snafu(display("failed to parse \"{subject}\" as subject"))]
    ParseSubject {
        source: x509_cert::der::Error,
        subject: String,
    },

    #[snafu(display("failed to create key pair"))]
    CreateKeyPair { source: E },

    #[snafu(display("failed to serialize public key as PEM"))]
    SerializePublicKey { source: x509_cert::spki::Error },

    #[snafu(display("failed to decode SPKI from PEM"))]
    DecodeSpkiFromPem { source: x509_cert::der::Error },

    #[snafu(display("failed to derive authority key identifier from the CA key"))]
    DeriveKeyIdentifier { source: x509_cert::der::Error },

    #[snafu(display("failed to create certificate builder"))]
    CreateCertificateBuilder { source: x509_cert::builder::Error },

    #[snafu(display("failed to add certificate extension"))]
    AddCertificateExtension { source: x509_cert::builder::Error },

    #[snafu(display("failed to parse DNS name \"{dns_name}\" as a Ia5 string"))]
    ParseDnsName {
        dns_name: String,
        source: x509_cert::der::Error,
    },

    #[snafu(display("failed to build certificate"))]
    BuildCertificate { source: x509_cert::builder::Error },
}

/// This builder builds the serving certificate of the webhook, signed by a
/// [`CertificateAuthority`].
///
/// The subject common name and the only subject alternative name are both set
/// to `dns_name`. The certificate may only be used for TLS server
/// authentication. Its `notAfter` never exceeds the one of the signing CA.
///
/// ```no_run
/// use fluid_certs::{CertificatePair, ca::CertificateAuthority};
///
/// let ca = CertificateAuthority::builder_with_ecdsa()
///     .build()
///     .expect("failed to build CA");
///
/// let certificate = CertificatePair::builder()
///     .dns_name("fluid-pod-admission-webhook.fluid-system.svc")
///     .signed_by(&ca)
///     .build()
///     .expect("failed to build certificate");
/// ```
#[derive(Builder)]
#[builder(start_fn = start_builder, finish_fn = finish_builder)]
pub struct LeafCertificateBuilder<'a, KP>
where
    KP: CertificateKeypair,
    <KP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    /// The DNS name the webhook is reached at.
    dns_name: &'a str,

    /// Lifetime of the certificate, counted from now.
    #[builder(default = DEFAULT_CA_VALIDITY)]
    validity: Duration,

    /// How far `notBefore` lies in the past.
    #[builder(default = DEFAULT_BACKDATE)]
    backdate: Duration,

    /// Cryptographic keypair bound to the certificate.
    ///
    /// If not specified a random keypair will be generated.
    key_pair: Option<KP>,

    /// Sign the certificate using the provided [`CertificateAuthority`].
    signed_by: &'a CertificateAuthority<KP>,
}

impl<KP> CertificatePair<KP>
where
    KP: CertificateKeypair,
    <KP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    pub fn builder<'a>() -> LeafCertificateBuilderBuilder<'a, KP> {
        LeafCertificateBuilder::start_builder()
    }
}

impl<KP, S> LeafCertificateBuilderBuilder<'_, KP, S>
where
    KP: CertificateKeypair,
    <KP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
    S: leaf_certificate_builder_builder::IsComplete,
{
    /// Convenience function to avoid calling `builder().finish_builder().build()`
    pub fn build(self) -> Result<CertificatePair<KP>, CreateCertificateError<KP::Error>> {
        self.finish_builder().build()
    }
}

impl<KP> LeafCertificateBuilder<'_, KP>
where
    KP: CertificateKeypair,
    <KP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    #[instrument(
        name = "build_serving_certificate",
        skip(self),
        fields(dns_name = self.dns_name),
    )]
    pub fn build(self) -> Result<CertificatePair<KP>, CreateCertificateError<KP::Error>> {
        ensure!(!self.dns_name.is_empty(), EmptyDnsNameSnafu);

        let mut validity = validity_window(SystemTime::now(), self.backdate, self.validity)
            .context(ParseValiditySnafu)?;

        let ca_tbs = &self.signed_by.ca_cert().tbs_certificate;
        if validity.not_after.to_system_time() > ca_tbs.validity.not_after.to_system_time() {
            validity.not_after = ca_tbs.validity.not_after;
        }

        let subject = format!("CN={dns_name}", dns_name = self.dns_name);
        let subject: Name = subject
            .parse()
            .with_context(|_| ParseSubjectSnafu { subject })?;
        let key_pair = match self.key_pair {
            Some(key_pair) => key_pair,
            None => KP::new().context(CreateKeyPairSnafu)?,
        };

        let serial_number = SerialNumber::from(rand::random::<u64>());

        let spki_pem = key_pair
            .verifying_key()
            .to_public_key_pem(PEM_LINE_ENDING)
            .context(SerializePublicKeySnafu)?;

        let spki = SubjectPublicKeyInfoOwned::from_pem(spki_pem.as_bytes())
            .context(DecodeSpkiFromPemSnafu)?;

        let aki = AuthorityKeyIdentifier::try_from(
            ca_tbs.subject_public_key_info.owned_to_ref(),
        )
        .context(DeriveKeyIdentifierSnafu)?;

        let dns_name = Ia5String::new(self.dns_name).with_context(|_| ParseDnsNameSnafu {
            dns_name: self.dns_name.to_owned(),
        })?;

        debug!(
            certificate.subject = %subject,
            certificate.not_after = %validity.not_after,
            certificate.not_before = %validity.not_before,
            certificate.serial = %serial_number,
            certificate.signed_by.issuer = %self.signed_by.subject_name(),
            certificate.public_key.algorithm = KP::algorithm_name(),
            certificate.public_key.size = KP::key_size(),
            "creating and signing serving certificate"
        );
        let signing_key = self.signed_by.signing_key();
        let mut builder = x509_cert::builder::CertificateBuilder::new(
            Profile::Manual {
                issuer: Some(self.signed_by.subject_name().clone()),
            },
            serial_number,
            validity,
            subject,
            spki,
            signing_key,
        )
        .context(CreateCertificateBuilderSnafu)?;

        builder
            .add_extension(&BasicConstraints {
                ca: false,
                path_len_constraint: None,
            })
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&KeyUsage(
                KeyUsages::DigitalSignature | KeyUsages::KeyEncipherment,
            ))
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&ExtendedKeyUsage(vec![ID_KP_SERVER_AUTH]))
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&SubjectAltName(vec![GeneralName::DnsName(dns_name)]))
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&aki)
            .context(AddCertificateExtensionSnafu)?;

        let certificate = builder
            .build::<KP::Signature>()
            .context(BuildCertificateSnafu)?;

        Ok(CertificatePair {
            certificate,
            key_pair,
        })
    }
}
