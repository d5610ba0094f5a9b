//! Two-key triple DES with retail MAC
//!
//! The cipher suite of ICAO Basic Access Control secure messaging:
//! 112-bit 3DES in CBC mode (zero IV) and the ISO 9797-1 algorithm 3
//! MAC ("retail MAC") over single-DES CBC.

use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use des::cipher::generic_array::GenericArray;
use des::{Des, TdesEde2};
use thiserror::Error;

use super::pad_iso;

/// 3DES block size.
pub const BLOCK_SIZE: usize = 8;
/// Two-key 3DES key size.
pub const KEY_SIZE: usize = 16;

type TdesCbcEnc = cbc::Encryptor<TdesEde2>;
type TdesCbcDec = cbc::Decryptor<TdesEde2>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TdesError {
    #[error("invalid 3DES key length {0}, expected 16")]
    InvalidKey(usize),

    #[error("data length {0} is not a multiple of the block size")]
    BlockAlignment(usize),
}

/// Encrypt with two-key 3DES-CBC and a zero IV.
pub fn encrypt_cbc(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, TdesError> {
    if key.len() != KEY_SIZE {
        return Err(TdesError::InvalidKey(key.len()));
    }
    if plaintext.len() % BLOCK_SIZE != 0 {
        return Err(TdesError::BlockAlignment(plaintext.len()));
    }
    let cipher = TdesCbcEnc::new_from_slices(key, &[0u8; BLOCK_SIZE])
        .map_err(|_| TdesError::InvalidKey(key.len()))?;
    Ok(cipher.encrypt_padded_vec_mut::<NoPadding>(plaintext))
}

/// Decrypt with two-key 3DES-CBC and a zero IV.
pub fn decrypt_cbc(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, TdesError> {
    if key.len() != KEY_SIZE {
        return Err(TdesError::InvalidKey(key.len()));
    }
    if ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(TdesError::BlockAlignment(ciphertext.len()));
    }
    let cipher = TdesCbcDec::new_from_slices(key, &[0u8; BLOCK_SIZE])
        .map_err(|_| TdesError::InvalidKey(key.len()))?;
    cipher
        .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
        .map_err(|_| TdesError::BlockAlignment(ciphertext.len()))
}

/// ISO 9797-1 algorithm 3 MAC with padding method 2.
///
/// Single-DES CBC under the first key half, with a final
/// decrypt-then-encrypt round under the second and first halves.
pub fn retail_mac(key: &[u8], data: &[u8]) -> Result<[u8; BLOCK_SIZE], TdesError> {
    if key.len() != KEY_SIZE {
        return Err(TdesError::InvalidKey(key.len()));
    }
    let k1 = Des::new(GenericArray::from_slice(&key[..8]));
    let k2 = Des::new(GenericArray::from_slice(&key[8..]));

    let padded = pad_iso(data, BLOCK_SIZE);
    let mut state = [0u8; BLOCK_SIZE];
    for chunk in padded.chunks(BLOCK_SIZE) {
        for (s, c) in state.iter_mut().zip(chunk) {
            *s ^= c;
        }
        let mut block = GenericArray::clone_from_slice(&state);
        k1.encrypt_block(&mut block);
        state.copy_from_slice(&block);
    }
    let mut block = GenericArray::clone_from_slice(&state);
    k2.decrypt_block(&mut block);
    k1.encrypt_block(&mut block);
    state.copy_from_slice(&block);
    Ok(state)
}

/// Force odd parity on every byte of a DES key.
pub fn adjust_parity(key: &mut [u8]) {
    for byte in key.iter_mut() {
        if byte.count_ones() % 2 == 0 {
            *byte ^= 0x01;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cbc_round_trip() {
        let key = [0x13u8; KEY_SIZE];
        let plaintext = [0xA5u8; 24];
        let ciphertext = encrypt_cbc(&key, &plaintext).unwrap();
        assert_ne!(&ciphertext[..], &plaintext[..]);
        assert_eq!(decrypt_cbc(&key, &ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn test_cbc_rejects_partial_block() {
        let key = [0u8; KEY_SIZE];
        assert_eq!(
            encrypt_cbc(&key, &[0u8; 7]),
            Err(TdesError::BlockAlignment(7))
        );
    }

    #[test]
    fn test_retail_mac_known_vector() {
        // Worked example from ICAO Doc 9303 part 11 (BAC session key
        // derivation appendix): MAC over the EIFD block.
        let key = hex::decode("7962d9ece03d1acd4c76089dce131543").unwrap();
        let data = hex::decode(
            "72c29c2371cc9bdb65b779b8e8d37b29ecc154aa56a8799fae2f498f76ed92f2",
        )
        .unwrap();
        let mac = retail_mac(&key, &data).unwrap();
        assert_eq!(hex::encode(mac), "5f1448eea8ad90a7");
    }

    #[test]
    fn test_adjust_parity() {
        let mut key = [0x00u8, 0x01, 0xAB, 0xFE];
        adjust_parity(&mut key);
        for byte in key {
            assert_eq!(byte.count_ones() % 2, 1);
        }
        // Bytes already odd-parity stay untouched.
        assert_eq!(key[1], 0x01);
    }
}
