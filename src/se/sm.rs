//! Secure messaging
//!
//! Unwraps protected command APDUs into plain ones and wraps responses,
//! driven by the checksum and confidentiality templates of the active
//! security environment. Odd-tagged data objects are authenticated;
//! the command header joins the checksum only under the
//! header-authenticating class.

use log::debug;
use subtle::ConstantTimeEq;

use crate::apdu::{Apdu, Response, SW};
use crate::crypto::{aes, pad_iso, tdes, unpad_iso};
use crate::error::{CardResult, SwError};
use crate::tlv::{self, Tlv};

use super::{Algorithm, Crt, SecurityEnvironment};

// Secure messaging data object tags.
const TAG_PLAIN: u32 = 0x80;
const TAG_PLAIN_AUTH: u32 = 0x81;
const TAG_CRYPTOGRAM: u32 = 0x84;
const TAG_CRYPTOGRAM_AUTH: u32 = 0x85;
const TAG_PI_CRYPTOGRAM: u32 = 0x86;
const TAG_PI_CRYPTOGRAM_AUTH: u32 = 0x87;
const TAG_HEADER: u32 = 0x89;
const TAG_CHECKSUM: u32 = 0x8E;
const TAG_HASH: u32 = 0x90;
const TAG_HASH_AUTH: u32 = 0x91;
const TAG_LE: u32 = 0x96;
const TAG_LE_AUTH: u32 = 0x97;
const TAG_STATUS: u32 = 0x99;
const TAG_SIGNATURE: u32 = 0x9E;
const TAG_CONTAINER: u32 = 0xB0;
const TAG_CONTAINER_AUTH: u32 = 0xB1;
const TAG_CONTAINER_PLAIN: u32 = 0xB2;
const TAG_CONTAINER_PLAIN_AUTH: u32 = 0xB3;

/// Increment a big-endian send sequence counter in place.
pub fn increment_ssc(ssc: &mut [u8]) {
    for byte in ssc.iter_mut().rev() {
        let (next, carry) = byte.overflowing_add(1);
        *byte = next;
        if !carry {
            break;
        }
    }
}

/// MAC over `data` with a checksum template, without touching its
/// counter. Used by both secure messaging and PSO.
pub fn checksum_over(crt: &Crt, data: &[u8]) -> CardResult<Vec<u8>> {
    match crt.algorithm {
        Some(Algorithm::TdesCbcRetailMac) => Ok(tdes::retail_mac(&crt.key, data)
            .map_err(|_| SwError::reference_not_usable())?
            .to_vec()),
        Some(Algorithm::Aes128CbcCmac) => Ok(aes::cmac8(&crt.key, data)
            .map_err(|_| SwError::reference_not_usable())?
            .to_vec()),
        _ => Err(SwError::reference_not_usable()),
    }
}

impl SecurityEnvironment {
    fn sm_mac(&self, auth: &[u8]) -> CardResult<Vec<u8>> {
        let mut input = self.checksum.ssc.clone();
        input.extend_from_slice(auth);
        checksum_over(&self.checksum, &input)
    }

    /// Encrypt a payload for a cryptogram object, ISO-padded, with the
    /// padding indicator prefixed.
    pub fn encipher_payload(&self, payload: &[u8]) -> CardResult<Vec<u8>> {
        let mut out = vec![0x01];
        match self.confidentiality.algorithm {
            Some(Algorithm::TdesCbcRetailMac) => {
                let padded = pad_iso(payload, tdes::BLOCK_SIZE);
                out.extend(
                    tdes::encrypt_cbc(&self.confidentiality.key, &padded)
                        .map_err(|_| SwError::reference_not_usable())?,
                );
            }
            Some(Algorithm::Aes128CbcCmac) => {
                let iv = self.cipher_iv()?;
                let padded = pad_iso(payload, aes::BLOCK_SIZE);
                out.extend(
                    aes::encrypt_cbc(&self.confidentiality.key, &iv, &padded)
                        .map_err(|_| SwError::reference_not_usable())?,
                );
            }
            _ => return Err(SwError::reference_not_usable()),
        }
        Ok(out)
    }

    pub(crate) fn decipher_payload(
        &self,
        padding_indicator: Option<u8>,
        cryptogram: &[u8],
    ) -> CardResult<Vec<u8>> {
        let plain = match self.confidentiality.algorithm {
            Some(Algorithm::TdesCbcRetailMac) => {
                tdes::decrypt_cbc(&self.confidentiality.key, cryptogram)
                    .map_err(|_| SwError::sm_objects_incorrect())?
            }
            Some(Algorithm::Aes128CbcCmac) => {
                let iv = self.cipher_iv()?;
                aes::decrypt_cbc(&self.confidentiality.key, &iv, cryptogram)
                    .map_err(|_| SwError::sm_objects_incorrect())?
            }
            _ => return Err(SwError::reference_not_usable()),
        };
        match padding_indicator {
            Some(0x01) => unpad_iso(&plain).ok_or_else(SwError::sm_objects_incorrect),
            _ => Ok(plain),
        }
    }

    /// The CBC IV: zero for 3DES, the encrypted counter for AES.
    fn cipher_iv(&self) -> CardResult<Vec<u8>> {
        match self.confidentiality.algorithm {
            Some(Algorithm::Aes128CbcCmac) => {
                let mut ssc = vec![0u8; aes::BLOCK_SIZE];
                let counter = &self.checksum.ssc;
                if counter.len() <= aes::BLOCK_SIZE {
                    ssc[aes::BLOCK_SIZE - counter.len()..].copy_from_slice(counter);
                }
                Ok(aes::encrypt_block(&self.confidentiality.key, &ssc)
                    .map_err(|_| SwError::reference_not_usable())?
                    .to_vec())
            }
            _ => Ok(vec![0u8; tdes::BLOCK_SIZE]),
        }
    }

    /// Take armed chip-authentication keys into use, once.
    fn take_deferred_keys(&mut self) {
        if let Some(keys) = self.deferred_keys.take() {
            debug!("switching secure messaging to deferred session keys");
            self.install_session_keys(&keys);
        }
    }

    /// Unwrap a protected command into the plain APDU it carries.
    pub fn unwrap_command(&mut self, apdu: &Apdu) -> CardResult<Apdu> {
        self.take_deferred_keys();
        if !self.sm_available() {
            return Err(SwError::new(SW::SECURE_MESSAGING_NOT_SUPPORTED));
        }
        increment_ssc(&mut self.checksum.ssc);

        let objects = tlv::decode(&apdu.data).map_err(|_| SwError::sm_objects_incorrect())?;
        let header_auth = apdu.class().sm.authenticates_header();

        let mut auth = Vec::new();
        if header_auth {
            auth.extend(pad_iso(&apdu.header(), self.checksum.block_length));
        }

        let mut state = UnwrapState {
            body: Vec::new(),
            header: None,
            le: None,
            checksum_seen: false,
        };
        self.process_objects(&objects, &mut auth, &mut state)?;

        if !state.checksum_seen {
            return Err(SwError::sm_objects_missing());
        }

        let (cla, ins, p1, p2) = match state.header {
            Some(header) => (header[0], header[1], header[2], header[3]),
            // Reconstructed class: the original with its SM bits cleared.
            None => {
                let sm_mask = if apdu.cla & 0xC0 == 0x40 { 0x20 } else { 0x0C };
                (apdu.cla & !sm_mask, apdu.ins, apdu.p1, apdu.p2)
            }
        };
        Ok(Apdu {
            cla,
            ins,
            p1,
            p2,
            data: state.body,
            le: state.le,
        })
    }

    fn process_objects(
        &self,
        objects: &[Tlv],
        auth: &mut Vec<u8>,
        state: &mut UnwrapState,
    ) -> CardResult<()> {
        for object in objects {
            // Odd-tagged objects enter the checksum as raw TLV bytes.
            let authenticated = object.has_odd_tag();
            match object.tag {
                TAG_PLAIN | TAG_PLAIN_AUTH => {
                    state.body.extend_from_slice(&object.value);
                }
                TAG_CONTAINER | TAG_CONTAINER_AUTH => {
                    self.process_objects(&object.children, auth, state)?;
                }
                TAG_CONTAINER_PLAIN | TAG_CONTAINER_PLAIN_AUTH => {
                    state.body.extend_from_slice(&object.value);
                }
                TAG_CRYPTOGRAM | TAG_CRYPTOGRAM_AUTH => {
                    let plain = self.decipher_payload(None, &object.value)?;
                    state.body.extend_from_slice(&plain);
                }
                TAG_PI_CRYPTOGRAM | TAG_PI_CRYPTOGRAM_AUTH => {
                    let (indicator, cryptogram) = object
                        .value
                        .split_first()
                        .ok_or_else(SwError::sm_objects_incorrect)?;
                    let plain = self.decipher_payload(Some(*indicator), cryptogram)?;
                    state.body.extend_from_slice(&plain);
                }
                TAG_HEADER => {
                    if object.value.len() != 4 {
                        return Err(SwError::sm_objects_incorrect());
                    }
                    let mut header = [0u8; 4];
                    header.copy_from_slice(&object.value);
                    state.header = Some(header);
                }
                TAG_LE | TAG_LE_AUTH => {
                    let raw = object
                        .value
                        .iter()
                        .fold(0u32, |acc, &b| (acc << 8) | b as u32);
                    state.le = Some(if raw == 0 { 256 } else { raw });
                }
                TAG_CHECKSUM => {
                    let expected = self.sm_mac(auth)?;
                    if expected.ct_eq(&object.value).unwrap_u8() != 1 {
                        debug!("secure messaging checksum mismatch");
                        return Err(SwError::sm_objects_incorrect());
                    }
                    state.checksum_seen = true;
                }
                TAG_HASH | TAG_HASH_AUTH => {
                    let algorithm = self
                        .hash
                        .hash_algorithm()
                        .ok_or_else(SwError::reference_not_usable)?;
                    let expected = crate::crypto::hash::hash(algorithm, auth);
                    if expected.ct_eq(&object.value).unwrap_u8() != 1 {
                        return Err(SwError::sm_objects_incorrect());
                    }
                }
                TAG_SIGNATURE => {
                    let key_pair = self
                        .signature
                        .key_pair
                        .as_ref()
                        .ok_or_else(SwError::sm_objects_missing)?;
                    let public = key_pair.public_key()?;
                    if !crate::crypto::rsa::verify_raw(&public, auth, &object.value) {
                        return Err(SwError::sm_objects_incorrect());
                    }
                }
                TAG_STATUS => {
                    // Processing status in a command is tolerated and
                    // authenticated like any other odd-tagged object.
                }
                _ => return Err(SwError::sm_objects_incorrect()),
            }
            if authenticated {
                auth.extend(object.to_bytes());
            }
        }
        Ok(())
    }

    /// Wrap a handler response for the protected channel: cryptogram,
    /// processing status, checksum.
    pub fn wrap_response(&mut self, response: &Response) -> CardResult<Response> {
        if !self.sm_available() {
            return Err(SwError::new(SW::SECURE_MESSAGING_NOT_SUPPORTED));
        }
        increment_ssc(&mut self.checksum.ssc);

        let mut objects = Vec::new();
        if !response.data.is_empty() {
            let cryptogram = self.encipher_payload(&response.data)?;
            objects.extend(Tlv::new(TAG_PI_CRYPTOGRAM_AUTH, cryptogram).to_bytes());
        }
        objects.extend(
            Tlv::new(TAG_STATUS, vec![response.sw1(), response.sw2()]).to_bytes(),
        );
        let mac = self.sm_mac(&objects)?;
        objects.extend(Tlv::new(TAG_CHECKSUM, mac).to_bytes());
        Ok(Response::new(objects, response.sw))
    }

    /// Wrap a plain command for the protected channel. This is the
    /// terminal's side of the exchange, used by tests and relay
    /// tooling; the card itself only unwraps commands.
    pub fn wrap_command(&mut self, apdu: &Apdu) -> CardResult<Apdu> {
        self.take_deferred_keys();
        if !self.sm_available() {
            return Err(SwError::new(SW::SECURE_MESSAGING_NOT_SUPPORTED));
        }
        increment_ssc(&mut self.checksum.ssc);

        let cla = apdu.cla | 0x0C;
        let header = [cla, apdu.ins, apdu.p1, apdu.p2];
        let mut auth = pad_iso(&header, self.checksum.block_length);

        let mut objects = Vec::new();
        if !apdu.data.is_empty() {
            let cryptogram = self.encipher_payload(&apdu.data)?;
            let object = Tlv::new(TAG_PI_CRYPTOGRAM_AUTH, cryptogram).to_bytes();
            auth.extend_from_slice(&object);
            objects.extend(object);
        }
        if let Some(le) = apdu.le {
            let value = if le >= 256 { vec![0x00] } else { vec![le as u8] };
            let object = Tlv::new(TAG_LE_AUTH, value).to_bytes();
            auth.extend_from_slice(&object);
            objects.extend(object);
        }
        let mac = self.sm_mac(&auth)?;
        objects.extend(Tlv::new(TAG_CHECKSUM, mac).to_bytes());

        Ok(Apdu {
            cla,
            ins: apdu.ins,
            p1: apdu.p1,
            p2: apdu.p2,
            data: objects,
            le: Some(256),
        })
    }
}

struct UnwrapState {
    body: Vec<u8>,
    header: Option<[u8; 4]>,
    le: Option<u32>,
    checksum_seen: bool,
}

#[cfg(test)]
mod tests {
    use super::super::{Algorithm, SecurityEnvironment, SessionKeys};
    use super::*;

    fn paired_environments(algorithm: Algorithm) -> (SecurityEnvironment, SecurityEnvironment) {
        let keys = SessionKeys {
            algorithm,
            enc: vec![0x11; 16],
            mac: vec![0x22; 16],
            ssc: match algorithm {
                Algorithm::TdesCbcRetailMac => vec![0u8; 8],
                _ => vec![0u8; 16],
            },
        };
        let mut card = SecurityEnvironment::new(1);
        card.install_session_keys(&keys);
        let mut terminal = SecurityEnvironment::new(1);
        terminal.install_session_keys(&keys);
        (card, terminal)
    }

    #[test]
    fn test_increment_ssc_carries() {
        let mut ssc = vec![0x00, 0xFF];
        increment_ssc(&mut ssc);
        assert_eq!(ssc, vec![0x01, 0x00]);
        let mut ssc = vec![0xFF, 0xFF];
        increment_ssc(&mut ssc);
        assert_eq!(ssc, vec![0x00, 0x00]);
    }

    #[test]
    fn test_command_round_trip_tdes() {
        let (mut card, mut terminal) = paired_environments(Algorithm::TdesCbcRetailMac);
        let plain = Apdu::with_data(0x00, 0xA4, 0x04, 0x00, b"appname".to_vec());
        let protected = terminal.wrap_command(&plain).unwrap();
        assert_ne!(protected.data, plain.data);
        let unwrapped = card.unwrap_command(&protected).unwrap();
        assert_eq!(unwrapped.ins, 0xA4);
        assert_eq!(unwrapped.data, b"appname");
    }

    #[test]
    fn test_command_round_trip_aes() {
        let (mut card, mut terminal) = paired_environments(Algorithm::Aes128CbcCmac);
        let mut plain = Apdu::with_data(0x00, 0xB0, 0x00, 0x00, vec![0x42; 20]);
        plain.le = Some(0x10);
        let protected = terminal.wrap_command(&plain).unwrap();
        let unwrapped = card.unwrap_command(&protected).unwrap();
        assert_eq!(unwrapped.data, vec![0x42; 20]);
        assert_eq!(unwrapped.le, Some(0x10));
    }

    #[test]
    fn test_bit_flip_is_detected() {
        let (mut card, mut terminal) = paired_environments(Algorithm::TdesCbcRetailMac);
        let plain = Apdu::with_data(0x00, 0xA4, 0x04, 0x00, b"appname".to_vec());
        let mut protected = terminal.wrap_command(&plain).unwrap();
        let middle = protected.data.len() / 2;
        protected.data[middle] ^= 0x01;
        let err = card.unwrap_command(&protected).unwrap_err();
        assert_eq!(err.sw, SW::INCORRECT_SM_DATA_OBJECTS);
    }

    #[test]
    fn test_missing_checksum_is_detected() {
        let (mut card, _) = paired_environments(Algorithm::TdesCbcRetailMac);
        // A protected command with only a plain-value object.
        let body = Tlv::new(0x81, b"data".to_vec()).to_bytes();
        let protected = Apdu::with_data(0x0C, 0xA4, 0x04, 0x00, body);
        let err = card.unwrap_command(&protected).unwrap_err();
        assert_eq!(err.sw, SW::EXPECTED_SM_DATA_OBJECTS_MISSING);
    }

    #[test]
    fn test_response_wrap_has_status_and_checksum() {
        let (mut card, _) = paired_environments(Algorithm::Aes128CbcCmac);
        let wrapped = card.wrap_response(&Response::success(vec![0x01, 0x02])).unwrap();
        assert_eq!(wrapped.sw, 0x9000);
        let objects = tlv::decode(&wrapped.data).unwrap();
        assert_eq!(objects[0].tag, 0x87);
        assert_eq!(objects[1].tag, 0x99);
        assert_eq!(objects[1].value, vec![0x90, 0x00]);
        assert_eq!(objects[2].tag, 0x8E);
        assert_eq!(objects[2].value.len(), 8);
    }

    #[test]
    fn test_empty_response_has_no_cryptogram() {
        let (mut card, _) = paired_environments(Algorithm::TdesCbcRetailMac);
        let wrapped = card.wrap_response(&Response::ok()).unwrap();
        let objects = tlv::decode(&wrapped.data).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].tag, 0x99);
    }

    #[test]
    fn test_deferred_keys_switch_on_next_command() {
        let (mut card, mut terminal) = paired_environments(Algorithm::Aes128CbcCmac);
        let new_keys = SessionKeys {
            algorithm: Algorithm::Aes128CbcCmac,
            enc: vec![0x33; 16],
            mac: vec![0x44; 16],
            ssc: vec![0u8; 16],
        };
        card.defer_session_keys(new_keys.clone());
        // The terminal switches immediately; the card on its next
        // unwrap.
        terminal.install_session_keys(&new_keys);
        let plain = Apdu::with_data(0x00, 0xB0, 0x00, 0x00, vec![0x55; 8]);
        let protected = terminal.wrap_command(&plain).unwrap();
        let unwrapped = card.unwrap_command(&protected).unwrap();
        assert_eq!(unwrapped.data, vec![0x55; 8]);
    }
}
