use std::sync::Arc;

use arc_swap::ArcSwap;
use fluid_certs::CertificateArtifacts;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tokio_rustls::rustls::{
    crypto::ring::default_provider,
    pki_types::CertificateDer,
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};

type Result<T, E = CertificateResolverError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum CertificateResolverError {
    #[snafu(display("failed to read the {artifact} PEM"))]
    ReadPem {
        source: std::io::Error,
        artifact: &'static str,
    },

    #[snafu(display("the serving certificate PEM contains no certificate"))]
    MissingServingCertificate,

    #[snafu(display("the serving key PEM contains no private key"))]
    MissingServingKey,

    #[snafu(display("failed to decode CertifiedKey from DER"))]
    DecodeCertifiedKeyFromDer { source: tokio_rustls::rustls::Error },
}

/// This struct serves as [`ResolvesServerCert`] to always hand out the current certificate for TLS
/// client connections.
///
/// It offers the [`Self::rotate_certificate`] function to swap in a renewed certificate, which
/// hot-reloads the certificate in the running webhook. Established connections keep the
/// certificate they negotiated.
#[derive(Debug)]
pub struct CertificateResolver {
    /// Using a [`ArcSwap`] (over e.g. [`tokio::sync::RwLock`]), so that the synchronous TLS
    /// handshake never waits for a rotation.
    current_certified_key: ArcSwap<CertifiedKey>,
}

impl CertificateResolver {
    pub fn new(artifacts: &CertificateArtifacts) -> Result<Self> {
        Ok(Self {
            current_certified_key: ArcSwap::from_pointee(certified_key(artifacts)?),
        })
    }

    pub fn rotate_certificate(&self, artifacts: &CertificateArtifacts) -> Result<()> {
        let certified_key = certified_key(artifacts)?;
        self.current_certified_key.store(Arc::new(certified_key));

        Ok(())
    }

    pub fn current_certified_key(&self) -> Arc<CertifiedKey> {
        self.current_certified_key.load_full()
    }

    /// Returns whether the serving certificate of `artifacts` is the one handed out.
    pub fn serves(&self, artifacts: &CertificateArtifacts) -> bool {
        let Ok(serving_certs) = read_certificates(&artifacts.serving_cert, "serving certificate")
        else {
            return false;
        };

        serving_certs.first() == self.current_certified_key().cert.first()
    }
}

impl ResolvesServerCert for CertificateResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current_certified_key.load_full())
    }
}

/// Builds the [`CertifiedKey`] of the serving certificate. The CA certificate is appended to the
/// chain.
fn certified_key(artifacts: &CertificateArtifacts) -> Result<CertifiedKey> {
    let mut cert_chain = read_certificates(&artifacts.serving_cert, "serving certificate")?;
    ensure!(!cert_chain.is_empty(), MissingServingCertificateSnafu);
    cert_chain.extend(read_certificates(&artifacts.ca_cert, "CA certificate")?);

    let private_key = rustls_pemfile::private_key(&mut artifacts.serving_key.as_slice())
        .context(ReadPemSnafu {
            artifact: "serving key",
        })?
        .context(MissingServingKeySnafu)?;

    CertifiedKey::from_der(cert_chain, private_key, &default_provider())
        .context(DecodeCertifiedKeyFromDerSnafu)
}

fn read_certificates(pem: &[u8], artifact: &'static str) -> Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .context(ReadPemSnafu { artifact })
}
