//! ECDSA signing keys on the NIST P-256 curve.
use p256::{NistP256, pkcs8::DecodePrivateKey};
use rand_core::{CryptoRngCore, OsRng};
use snafu::{ResultExt, Snafu};
use tracing::instrument;

use crate::keys::CertificateKeypair;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to deserialize ECDSA key from PEM-encoded PKCS8"))]
    DeserializeKeyFromPem { source: p256::pkcs8::Error },
}

#[derive(Debug)]
pub struct SigningKey(p256::ecdsa::SigningKey);

impl CertificateKeypair for SigningKey {
    type Error = Error;
    type Signature = ecdsa::der::Signature<NistP256>;
    type SigningKey = p256::ecdsa::SigningKey;
    type VerifyingKey = p256::ecdsa::VerifyingKey;

    #[instrument(name = "create_ecdsa_signing_key")]
    fn new() -> Result<Self> {
        let mut csprng = OsRng;
        Self::new_with_rng(&mut csprng)
    }

    #[instrument(name = "create_ecdsa_signing_key_custom_rng", skip_all)]
    fn new_with_rng<Rng>(rng: &mut Rng) -> Result<Self>
    where
        Rng: CryptoRngCore + Sized,
    {
        let signing_key = p256::ecdsa::SigningKey::random(rng);
        Ok(Self(signing_key))
    }

    fn signing_key(&self) -> &Self::SigningKey {
        &self.0
    }

    fn verifying_key(&self) -> Self::VerifyingKey {
        *self.0.verifying_key()
    }

    #[instrument(name = "create_ecdsa_signing_key_from_pkcs8_pem", skip_all)]
    fn from_pkcs8_pem(input: &str) -> Result<Self> {
        let signing_key =
            p256::ecdsa::SigningKey::from_pkcs8_pem(input).context(DeserializeKeyFromPemSnafu)?;

        Ok(Self(signing_key))
    }

    fn algorithm_name() -> &'static str {
        "ecdsa"
    }

    fn key_size() -> usize {
        256
    }
}

#[cfg(test)]
mod tests {
    use p256::pkcs8::{EncodePrivateKey, LineEnding};
    use x509_cert::spki::EncodePublicKey;

    use super::*;

    #[test]
    fn pkcs8_pem_keeps_public_key() {
        let key = SigningKey::new().expect("failed to generate key");
        let pem = key
            .signing_key()
            .to_pkcs8_pem(LineEnding::LF)
            .expect("failed to encode key");

        let decoded = SigningKey::from_pkcs8_pem(&pem).expect("failed to decode key");
        assert_eq!(
            key.verifying_key().to_public_key_der().unwrap(),
            decoded.verifying_key().to_public_key_der().unwrap()
        );
    }

    #[test]
    fn garbage_is_rejected() {
        let err = SigningKey::from_pkcs8_pem("not a key").unwrap_err();
        assert!(matches!(err, Error::DeserializeKeyFromPem { .. }));
    }
}
