//! RSA operations
//!
//! Key generation for GENERATE PUBLIC KEY PAIR and the PSO signature /
//! encipherment paths, on top of the rsa crate.

use log::debug;
use rand::rngs::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RsaError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed")]
    Decryption,

    #[error("invalid stored key: {0}")]
    InvalidKey(String),
}

/// Generate an RSA key pair of the given modulus size.
pub fn generate_keypair(bits: usize) -> Result<(RsaPrivateKey, RsaPublicKey), RsaError> {
    debug!("generating RSA-{bits} key pair");
    let private = RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|e| RsaError::KeyGeneration(e.to_string()))?;
    let public = RsaPublicKey::from(&private);
    Ok((private, public))
}

/// Big-endian modulus bytes of a public key.
pub fn modulus_bytes(key: &RsaPublicKey) -> Vec<u8> {
    key.n().to_bytes_be()
}

/// Big-endian public exponent bytes of a public key.
pub fn exponent_bytes(key: &RsaPublicKey) -> Vec<u8> {
    key.e().to_bytes_be()
}

/// PKCS#1 v1.5 signature over a caller-provided digest-info blob.
///
/// The card does not hash here; PSO hands over whatever the hash CRT
/// or the terminal prepared.
pub fn sign_raw(key: &RsaPrivateKey, digest_info: &[u8]) -> Result<Vec<u8>, RsaError> {
    key.sign(Pkcs1v15Sign::new_unprefixed(), digest_info)
        .map_err(|e| RsaError::Signing(e.to_string()))
}

/// Verify a PKCS#1 v1.5 signature over a digest-info blob.
pub fn verify_raw(key: &RsaPublicKey, digest_info: &[u8], signature: &[u8]) -> bool {
    key.verify(Pkcs1v15Sign::new_unprefixed(), digest_info, signature)
        .is_ok()
}

/// PKCS#1 v1.5 encryption (PSO ENCIPHER, INTERNAL AUTHENTICATE).
pub fn encrypt(key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>, RsaError> {
    key.encrypt(&mut OsRng, Pkcs1v15Encrypt, plaintext)
        .map_err(|e| RsaError::Encryption(e.to_string()))
}

/// PKCS#1 v1.5 decryption (PSO DECIPHER).
pub fn decrypt(key: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>, RsaError> {
    key.decrypt(Pkcs1v15Encrypt, ciphertext)
        .map_err(|_| RsaError::Decryption)
}
