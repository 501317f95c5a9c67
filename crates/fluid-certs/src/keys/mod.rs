//! Private key primitives used to sign the webhook CA and to bind to the
//! serving certificate.
//!
//! Two algorithms are available:
//!
//! - [ECDSA](ecdsa) on the NIST P-256 curve, which is the default for all
//!   generated bundles. Key generation is fast and the keys are small.
//! - [RSA](rsa) with PKCS#1 v1.5 signatures over SHA-256.
//!
//! ```no_run
//! use fluid_certs::keys::{CertificateKeypair, ecdsa::SigningKey};
//! let key = SigningKey::new().unwrap();
//! ```
//!
//! The RSA implementation is affected by the Marvin attack, see
//! <https://rustsec.org/advisories/RUSTSEC-2023-0071.html>. Signing only
//! happens locally during generation, decryption is never performed.
use std::fmt::Debug;

use p256::pkcs8::EncodePrivateKey;
use rand_core::CryptoRngCore;
use signature::{Keypair, Signer};
use x509_cert::spki::{EncodePublicKey, SignatureAlgorithmIdentifier, SignatureBitStringEncoding};

pub mod ecdsa;
pub mod rsa;

pub trait CertificateKeypair
where
    <Self::SigningKey as Keypair>::VerifyingKey: EncodePublicKey,
    Self: Debug + Sized + Send + 'static,
{
    type SigningKey: SignatureAlgorithmIdentifier
        + Keypair
        + Signer<Self::Signature>
        + EncodePrivateKey;
    type Signature: SignatureBitStringEncoding;
    type VerifyingKey: EncodePublicKey;

    type Error: std::error::Error + Send + Sync + 'static;

    /// Generates a new key with the default random-number generator [`rand_core::OsRng`].
    fn new() -> Result<Self, Self::Error>;

    /// Generates a new key with a custom random-number generator.
    fn new_with_rng<Rng>(rng: &mut Rng) -> Result<Self, Self::Error>
    where
        Rng: CryptoRngCore + Sized;

    /// Returns the signing (private) key half of the keypair.
    fn signing_key(&self) -> &Self::SigningKey;

    /// Returns the verifying (public) half of the keypair.
    fn verifying_key(&self) -> Self::VerifyingKey;

    /// Creates a signing key pair from the PEM-encoded PKCS#8 private key.
    fn from_pkcs8_pem(input: &str) -> Result<Self, Self::Error>;

    /// The name of the algorithm such as `rsa` or `ecdsa`.
    fn algorithm_name() -> &'static str;

    /// The key length in bits.
    fn key_size() -> usize;
}
