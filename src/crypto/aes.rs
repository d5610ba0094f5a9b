//! AES-128 with CMAC
//!
//! The cipher suite of PACE secure messaging: AES-128 in CBC mode and
//! CMAC truncated to 8 bytes for authentication tokens and SM
//! checksums.

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cmac::{Cmac, Mac};
use thiserror::Error;

/// AES block size.
pub const BLOCK_SIZE: usize = 16;
/// AES-128 key size.
pub const KEY_SIZE: usize = 16;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AesError {
    #[error("invalid AES-128 key or IV length")]
    InvalidKey,

    #[error("data length {0} is not a multiple of the block size")]
    BlockAlignment(usize),
}

/// Encrypt with AES-128-CBC.
pub fn encrypt_cbc(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, AesError> {
    if plaintext.len() % BLOCK_SIZE != 0 {
        return Err(AesError::BlockAlignment(plaintext.len()));
    }
    let cipher = Aes128CbcEnc::new_from_slices(key, iv).map_err(|_| AesError::InvalidKey)?;
    Ok(cipher.encrypt_padded_vec_mut::<NoPadding>(plaintext))
}

/// Decrypt with AES-128-CBC.
pub fn decrypt_cbc(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, AesError> {
    if ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(AesError::BlockAlignment(ciphertext.len()));
    }
    let cipher = Aes128CbcDec::new_from_slices(key, iv).map_err(|_| AesError::InvalidKey)?;
    cipher
        .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
        .map_err(|_| AesError::BlockAlignment(ciphertext.len()))
}

/// Encrypt a single block in ECB mode; used to turn the send sequence
/// counter into a CBC IV.
pub fn encrypt_block(key: &[u8], block: &[u8]) -> Result<[u8; BLOCK_SIZE], AesError> {
    if block.len() != BLOCK_SIZE {
        return Err(AesError::BlockAlignment(block.len()));
    }
    let cipher = Aes128::new_from_slice(key).map_err(|_| AesError::InvalidKey)?;
    let mut buf = [0u8; BLOCK_SIZE];
    buf.copy_from_slice(block);
    let mut ga = aes::cipher::generic_array::GenericArray::from(buf);
    cipher.encrypt_block(&mut ga);
    buf.copy_from_slice(&ga);
    Ok(buf)
}

/// Full-width AES-128 CMAC.
pub fn cmac(key: &[u8], data: &[u8]) -> Result<[u8; BLOCK_SIZE], AesError> {
    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key).map_err(|_| AesError::InvalidKey)?;
    mac.update(data);
    let mut out = [0u8; BLOCK_SIZE];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// CMAC truncated to its leading 8 bytes, the width used on the wire.
pub fn cmac8(key: &[u8], data: &[u8]) -> Result<[u8; 8], AesError> {
    let full = cmac(key, data)?;
    let mut out = [0u8; 8];
    out.copy_from_slice(&full[..8]);
    Ok(out)
}
