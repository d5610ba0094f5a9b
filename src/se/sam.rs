//! Secure access module
//!
//! Owner of the card's authentication state: secrets, the PIN retry
//! counter, the last issued challenge, the current security
//! environment and its stored snapshots. Every authentication-family
//! instruction lands here.

use std::collections::HashMap;

use log::{debug, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;

use serde::{Deserialize, Serialize};

use crate::crypto::{pad_iso, rsa, tdes};
use crate::error::{CardResult, SwError};
use crate::fs::{FileTree, Selector};
use crate::tlv::{self, Tlv, TlvBuilder};

use super::sm::checksum_over;
use super::{CrtKind, SecurityEnvironment, StoredKeyPair};

/// Password references used by VERIFY's P2 and the PACE password id.
pub const PWD_MRZ: u8 = 0x01;
pub const PWD_CAN: u8 = 0x02;
pub const PWD_PIN: u8 = 0x03;
pub const PWD_PUK: u8 = 0x04;

/// Default and maximum PIN retry count.
pub const DEFAULT_RETRIES: u8 = 3;

/// The secure access module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecureAccessModule {
    /// Card-global secret for INTERNAL/EXTERNAL AUTHENTICATE.
    #[serde(with = "crate::bytes")]
    card_secret: Vec<u8>,
    #[serde(with = "crate::bytes")]
    pin: Vec<u8>,
    #[serde(with = "crate::bytes")]
    puk: Vec<u8>,
    /// Card access number, used by the PACE CAN path when set.
    #[serde(with = "crate::bytes")]
    can: Vec<u8>,
    /// MRZ-derived password bytes, used by BAC and the PACE MRZ path.
    #[serde(with = "crate::bytes")]
    mrz: Vec<u8>,
    retry_counter: u8,
    max_retries: u8,
    blocked: bool,
    /// Imported card verifiable certificates (chain validation is not
    /// performed).
    certificates: Vec<Vec<u8>>,
    saved_environments: HashMap<u8, SecurityEnvironment>,
    pub current_se: SecurityEnvironment,
    /// Pristine environment restored on power cycles.
    initial_se: SecurityEnvironment,
    #[serde(skip)]
    last_challenge: Option<Vec<u8>>,
    #[serde(skip)]
    verified: bool,
    #[serde(skip)]
    external_authenticated: bool,
}

impl SecureAccessModule {
    pub fn new(card_secret: Vec<u8>, pin: Vec<u8>, puk: Vec<u8>) -> Self {
        let se = SecurityEnvironment::new(0);
        Self {
            card_secret,
            pin,
            puk,
            can: Vec::new(),
            mrz: Vec::new(),
            retry_counter: DEFAULT_RETRIES,
            max_retries: DEFAULT_RETRIES,
            blocked: false,
            certificates: Vec::new(),
            saved_environments: HashMap::new(),
            current_se: se.clone(),
            initial_se: se,
            last_challenge: None,
            verified: false,
            external_authenticated: false,
        }
    }

    /// Configure the environment shipped at personalization; it is
    /// also what a power cycle restores.
    pub fn set_initial_environment(&mut self, se: SecurityEnvironment) {
        self.current_se = se.clone();
        self.initial_se = se;
    }

    pub fn set_can(&mut self, can: Vec<u8>) {
        self.can = can;
    }

    pub fn set_mrz_password(&mut self, mrz: Vec<u8>) {
        self.mrz = mrz;
    }

    /// Clear all session state; persistent secrets survive.
    pub fn reset_session(&mut self) {
        self.current_se = self.initial_se.clone();
        self.last_challenge = None;
        self.verified = false;
        self.external_authenticated = false;
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn retries_left(&self) -> u8 {
        self.retry_counter
    }

    pub fn last_challenge(&self) -> Option<&[u8]> {
        self.last_challenge.as_deref()
    }

    pub fn take_challenge(&mut self) -> Option<Vec<u8>> {
        self.last_challenge.take()
    }

    /// Remember a challenge issued outside GET CHALLENGE (protocol
    /// steps that mint their own nonces).
    pub fn remember_challenge(&mut self, challenge: Vec<u8>) {
        self.last_challenge = Some(challenge);
    }

    /// Look up a password by reference, enforcing availability and,
    /// for the PIN, the retry budget.
    pub fn password(&self, reference: u8) -> CardResult<&[u8]> {
        let (value, guarded) = match reference {
            PWD_MRZ => (&self.mrz, false),
            PWD_CAN => (&self.can, false),
            PWD_PIN => (&self.pin, true),
            PWD_PUK => (&self.puk, false),
            _ => return Err(SwError::reference_not_usable()),
        };
        if value.is_empty() {
            return Err(SwError::reference_not_usable());
        }
        if guarded && (self.blocked || self.retry_counter == 0) {
            return Err(SwError::authentication_blocked());
        }
        Ok(value)
    }

    /// Punish a failed PIN-path authentication attempt.
    pub fn penalize_pin(&mut self) {
        self.retry_counter = self.retry_counter.saturating_sub(1);
        if self.retry_counter == 0 {
            warn!("PIN retry counter exhausted, blocking");
            self.blocked = true;
        }
    }

    /// Restore the PIN retry budget (successful VERIFY, PACE over CAN
    /// or PUK).
    pub fn restore_pin(&mut self) {
        self.retry_counter = self.max_retries;
        self.blocked = false;
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// VERIFY: compare a presented secret against the reference,
    /// decrementing the retry counter on mismatch. An empty body
    /// queries the verification state.
    pub fn cmd_verify(&mut self, p1: u8, _p2: u8, data: &[u8]) -> CardResult<Vec<u8>> {
        if p1 != 0x00 {
            return Err(SwError::incorrect_p1p2());
        }
        if self.blocked {
            return Err(SwError::authentication_blocked());
        }
        if data.is_empty() {
            if self.verified {
                return Ok(Vec::new());
            }
            return Err(SwError::warn_tries_left(self.retry_counter));
        }
        // Transport formats pad the secret with 0xFF.
        let presented: Vec<u8> = data
            .iter()
            .copied()
            .take_while(|&byte| byte != 0xFF)
            .collect();
        if presented.ct_eq(&self.pin).unwrap_u8() == 1 {
            self.restore_pin();
            self.verified = true;
            debug!("secret verified, retry counter restored");
            Ok(Vec::new())
        } else {
            self.penalize_pin();
            if self.blocked {
                Err(SwError::authentication_blocked())
            } else {
                Err(SwError::warn_tries_left(self.retry_counter))
            }
        }
    }

    /// CHANGE REFERENCE DATA: P1 0x00 takes old and new secret
    /// concatenated, P1 0x01 only the new one after a prior VERIFY.
    pub fn cmd_change_reference_data(
        &mut self,
        p1: u8,
        p2: u8,
        data: &[u8],
    ) -> CardResult<Vec<u8>> {
        if self.blocked {
            return Err(SwError::authentication_blocked());
        }
        match p1 {
            0x00 => {
                if data.len() <= self.pin.len() {
                    return Err(SwError::wrong_length());
                }
                let (old, new) = data.split_at(self.pin.len());
                self.cmd_verify(0x00, p2, old)?;
                self.pin = new.to_vec();
                Ok(Vec::new())
            }
            0x01 => {
                if !self.verified {
                    return Err(SwError::security_status_not_satisfied());
                }
                if data.is_empty() {
                    return Err(SwError::wrong_length());
                }
                self.pin = data.to_vec();
                Ok(Vec::new())
            }
            _ => Err(SwError::incorrect_p1p2()),
        }
    }

    /// GET CHALLENGE: a fresh random nonce, remembered as the sole
    /// valid challenge for the next authentication.
    pub fn cmd_get_challenge(&mut self, le: Option<u32>) -> CardResult<Vec<u8>> {
        let length = match le {
            Some(le) if le > 0 && le <= 256 => le as usize,
            _ => 8,
        };
        let mut challenge = vec![0u8; length];
        OsRng.fill_bytes(&mut challenge);
        self.last_challenge = Some(challenge.clone());
        Ok(challenge)
    }

    /// The symmetric key selected by P1/P2 for INTERNAL/EXTERNAL
    /// AUTHENTICATE: the card secret for P2 zero, otherwise the
    /// contents of the file addressed by P2's low bits as a short fid.
    fn authentication_key(&self, p2: u8, fs: &mut FileTree) -> CardResult<Vec<u8>> {
        if p2 == 0x00 {
            return Ok(self.card_secret.clone());
        }
        let id = fs.resolve(&Selector::ShortFid(p2 & 0x1F))?;
        match &fs
            .node(id)
            .map_err(|_| SwError::reference_not_usable())?
            .body
        {
            crate::fs::FileBody::Transparent { data, .. } => Ok(data.clone()),
            _ => Err(SwError::reference_not_usable()),
        }
    }

    /// INTERNAL AUTHENTICATE: encrypt the caller's token under the
    /// selected key.
    pub fn cmd_internal_authenticate(
        &mut self,
        _p1: u8,
        p2: u8,
        data: &[u8],
        fs: &mut FileTree,
    ) -> CardResult<Vec<u8>> {
        if data.is_empty() {
            return Err(SwError::wrong_length());
        }
        let key = self.authentication_key(p2, fs)?;
        let padded = pad_iso(data, tdes::BLOCK_SIZE);
        tdes::encrypt_cbc(&key, &padded)
            .map_err(|_| SwError::reference_not_usable())
    }

    /// EXTERNAL AUTHENTICATE: re-derive the expected cryptogram over
    /// the last challenge and compare.
    pub fn cmd_external_authenticate(
        &mut self,
        _p1: u8,
        p2: u8,
        data: &[u8],
        fs: &mut FileTree,
    ) -> CardResult<Vec<u8>> {
        let challenge = self
            .last_challenge
            .take()
            .ok_or_else(SwError::conditions_not_satisfied)?;
        let key = self.authentication_key(p2, fs)?;
        let padded = pad_iso(&challenge, tdes::BLOCK_SIZE);
        let expected = tdes::encrypt_cbc(&key, &padded)
            .map_err(|_| SwError::reference_not_usable())?;
        if expected.ct_eq(data).unwrap_u8() == 1 {
            self.external_authenticated = true;
            Ok(Vec::new())
        } else {
            Err(SwError::security_status_not_satisfied())
        }
    }

    /// MANAGE SECURITY ENVIRONMENT: SET updates one CRT of the current
    /// environment, STORE/RESTORE/ERASE act on the snapshot map.
    pub fn cmd_manage_security_environment(
        &mut self,
        p1: u8,
        p2: u8,
        data: &[u8],
    ) -> CardResult<Vec<u8>> {
        match p1 & 0x0F {
            0x01 => {
                let kind = CrtKind::from_tag(p2)?;
                let objects = tlv::decode(data).map_err(|_| SwError::wrong_data())?;
                self.current_se.crt_mut(kind).update_from(&objects)?;
                self.current_se.apply_scope(p1);
                debug!("MSE SET updated {kind:?} template");
                Ok(Vec::new())
            }
            0x02 => {
                let mut snapshot = self.current_se.clone();
                snapshot.reference = p2;
                self.saved_environments.insert(p2, snapshot);
                Ok(Vec::new())
            }
            0x03 => {
                let snapshot = self
                    .saved_environments
                    .get(&p2)
                    .ok_or_else(SwError::reference_not_usable)?;
                if snapshot.reference != p2 {
                    return Err(SwError::reference_not_usable());
                }
                self.current_se = snapshot.clone();
                Ok(Vec::new())
            }
            0x04 => {
                self.saved_environments
                    .remove(&p2)
                    .ok_or_else(SwError::reference_not_usable)?;
                Ok(Vec::new())
            }
            _ => Err(SwError::incorrect_p1p2()),
        }
    }

    /// PERFORM SECURITY OPERATION, multiplexed on (P1,P2).
    pub fn cmd_perform_security_operation(
        &mut self,
        p1: u8,
        p2: u8,
        data: &[u8],
    ) -> CardResult<Vec<u8>> {
        match (p1, p2) {
            // Hash.
            (0x90, 0x80) => {
                let algorithm = self
                    .current_se
                    .hash
                    .hash_algorithm()
                    .ok_or_else(SwError::reference_not_usable)?;
                Ok(crate::crypto::hash::hash(algorithm, data))
            }
            (0x90, 0xA0) => {
                let objects = tlv::decode(data).map_err(|_| SwError::wrong_data())?;
                let payload = tlv::find_first(&objects, 0x80)
                    .ok_or_else(SwError::wrong_data)?;
                let algorithm = self
                    .current_se
                    .hash
                    .hash_algorithm()
                    .ok_or_else(SwError::reference_not_usable)?;
                Ok(crate::crypto::hash::hash(algorithm, &payload.value))
            }
            // Cryptographic checksum.
            (0x8E, 0x80) => checksum_over(&self.current_se.checksum, data),
            (0x00, 0xA2) => {
                let objects = tlv::decode(data).map_err(|_| SwError::wrong_data())?;
                let payload = tlv::find_first(&objects, 0x80)
                    .ok_or_else(SwError::sm_objects_missing)?;
                let mac = tlv::find_first(&objects, 0x8E)
                    .ok_or_else(SwError::sm_objects_missing)?;
                let expected = checksum_over(&self.current_se.checksum, &payload.value)?;
                if expected.ct_eq(&mac.value).unwrap_u8() == 1 {
                    Ok(Vec::new())
                } else {
                    Err(SwError::sm_objects_incorrect())
                }
            }
            // Digital signature.
            (0x9E, 0x9A) => {
                let key_pair = self
                    .current_se
                    .signature
                    .key_pair
                    .as_ref()
                    .ok_or_else(SwError::reference_not_usable)?;
                let key = key_pair.to_key()?;
                rsa::sign_raw(&key, data).map_err(|_| SwError::wrong_data())
            }
            (0x00, 0xA8) => {
                let objects = tlv::decode(data).map_err(|_| SwError::wrong_data())?;
                let payload = tlv::find_first(&objects, 0x80)
                    .ok_or_else(SwError::wrong_data)?;
                let signature = tlv::find_first(&objects, 0x9E)
                    .ok_or_else(SwError::wrong_data)?;
                let key_pair = self
                    .current_se
                    .signature
                    .key_pair
                    .as_ref()
                    .ok_or_else(SwError::reference_not_usable)?;
                let public = key_pair.public_key()?;
                if rsa::verify_raw(&public, &payload.value, &signature.value) {
                    Ok(Vec::new())
                } else {
                    Err(SwError::security_status_not_satisfied())
                }
            }
            // Verify certificate: the chain is imported and remembered;
            // signature validation over the chain is not performed.
            (0x00, 0xAE) | (0x00, 0xBE) => {
                let objects = tlv::decode(data).map_err(|_| SwError::wrong_data())?;
                let body = tlv::find_first(&objects, 0x7F21)
                    .map(|t| t.to_bytes())
                    .unwrap_or_else(|| data.to_vec());
                if body.is_empty() {
                    return Err(SwError::wrong_data());
                }
                self.certificates.push(body);
                Ok(Vec::new())
            }
            // Encipher / decipher with the confidentiality template.
            (0x86, 0x80) => {
                if let Some(key_pair) = &self.current_se.confidentiality.key_pair {
                    let public = key_pair.public_key()?;
                    let mut out = vec![0x00];
                    out.extend(
                        rsa::encrypt(&public, data).map_err(|_| SwError::wrong_data())?,
                    );
                    return Ok(out);
                }
                self.current_se.encipher_payload(data)
            }
            (0x80, 0x86) => {
                if let Some(key_pair) = &self.current_se.confidentiality.key_pair {
                    let key = key_pair.to_key()?;
                    return rsa::decrypt(&key, data)
                        .map_err(|_| SwError::security_status_not_satisfied());
                }
                let (indicator, cryptogram) = data
                    .split_first()
                    .ok_or_else(SwError::wrong_length)?;
                self.current_se
                    .decipher_payload(Some(*indicator), cryptogram)
            }
            _ => Err(SwError::incorrect_p1p2()),
        }
    }

    /// Imported certificates, newest last.
    pub fn certificates(&self) -> &[Vec<u8>] {
        &self.certificates
    }

    /// GENERATE PUBLIC KEY PAIR: sized per the signature template,
    /// private part stored there, public components returned as nested
    /// BER-TLV unless P1 suppresses output.
    pub fn cmd_generate_keypair(&mut self, p1: u8, _p2: u8) -> CardResult<Vec<u8>> {
        let bits = self.current_se.signature.key_size_bits;
        let (private, public) =
            rsa::generate_keypair(bits).map_err(|_| SwError::new(crate::apdu::SW::UNKNOWN_ERROR))?;
        self.current_se.signature.key_pair = Some(StoredKeyPair::from_key(&private));
        if p1 & 0x01 != 0 {
            return Ok(Vec::new());
        }
        Ok(TlvBuilder::new()
            .push(0x81, &rsa::modulus_bytes(&public))
            .push(0x82, &rsa::exponent_bytes(&public))
            .wrap(0x7F49)
            .build())
    }
}

impl super::Crt {
    /// Hash algorithm selected on a hash template; SHA-256 unless the
    /// template references SHA-1.
    pub fn hash_algorithm(&self) -> Option<crate::crypto::hash::HashAlgorithm> {
        match self.algorithm_ref.as_slice() {
            [] | [0x40] => Some(crate::crypto::hash::HashAlgorithm::Sha256),
            [0x11] => Some(crate::crypto::hash::HashAlgorithm::Sha1),
            _ => None,
        }
    }
}

/// One TLV-encoded certificate body as accepted by PSO VERIFY
/// CERTIFICATE.
pub fn encode_certificate(body: &[u8]) -> Vec<u8> {
    Tlv::new(0x7F21, body.to_vec()).to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{FileHeader, FileNode};
    use crate::se::Algorithm;

    fn sam() -> SecureAccessModule {
        SecureAccessModule::new(vec![0x0F; 16], b"123456".to_vec(), b"87654321".to_vec())
    }

    #[test]
    fn test_verify_success_restores_counter() {
        let mut sam = sam();
        assert!(sam.cmd_verify(0, 0, b"999999").is_err());
        assert_eq!(sam.retries_left(), 2);
        sam.cmd_verify(0, 0, b"123456").unwrap();
        assert_eq!(sam.retries_left(), 3);
        assert!(sam.is_verified());
    }

    #[test]
    fn test_verify_blocks_after_three_misses() {
        let mut sam = sam();
        let first = sam.cmd_verify(0, 0, b"000000").unwrap_err();
        assert_eq!(first.sw, 0x63C2);
        let second = sam.cmd_verify(0, 0, b"000000").unwrap_err();
        assert_eq!(second.sw, 0x63C1);
        let third = sam.cmd_verify(0, 0, b"000000").unwrap_err();
        assert_eq!(third.sw, 0x6983);
        // Even the correct secret is rejected once blocked.
        let fourth = sam.cmd_verify(0, 0, b"123456").unwrap_err();
        assert_eq!(fourth.sw, 0x6983);
    }

    #[test]
    fn test_verify_padding_stripped() {
        let mut sam = sam();
        let mut padded = b"123456".to_vec();
        padded.extend([0xFF; 2]);
        sam.cmd_verify(0, 0, &padded).unwrap();
    }

    #[test]
    fn test_verify_empty_reports_state() {
        let mut sam = sam();
        let report = sam.cmd_verify(0, 0, &[]).unwrap_err();
        assert_eq!(report.sw, 0x63C3);
        sam.cmd_verify(0, 0, b"123456").unwrap();
        assert!(sam.cmd_verify(0, 0, &[]).is_ok());
    }

    #[test]
    fn test_change_reference_data() {
        let mut sam = sam();
        sam.cmd_change_reference_data(0x00, 0, b"123456654321").unwrap();
        sam.reset_session();
        sam.cmd_verify(0, 0, b"654321").unwrap();
    }

    #[test]
    fn test_change_reference_data_needs_verify() {
        let mut sam = sam();
        let err = sam
            .cmd_change_reference_data(0x01, 0, b"654321")
            .unwrap_err();
        assert_eq!(err.sw, 0x6982);
    }

    #[test]
    fn test_challenge_response_cycle() {
        let mut sam = sam();
        let mut fs = FileTree::new();
        let challenge = sam.cmd_get_challenge(Some(8)).unwrap();
        assert_eq!(challenge.len(), 8);

        // The terminal proves knowledge of the card secret.
        let padded = pad_iso(&challenge, 8);
        let cryptogram = tdes::encrypt_cbc(&[0x0F; 16], &padded).unwrap();
        sam.cmd_external_authenticate(0, 0, &cryptogram, &mut fs)
            .unwrap();

        // The challenge is single-use.
        let err = sam
            .cmd_external_authenticate(0, 0, &cryptogram, &mut fs)
            .unwrap_err();
        assert_eq!(err.sw, 0x6985);
    }

    #[test]
    fn test_external_authenticate_wrong_cryptogram() {
        let mut sam = sam();
        let mut fs = FileTree::new();
        sam.cmd_get_challenge(Some(8)).unwrap();
        let err = sam
            .cmd_external_authenticate(0, 0, &[0u8; 16], &mut fs)
            .unwrap_err();
        assert_eq!(err.sw, 0x6982);
    }

    #[test]
    fn test_internal_authenticate_with_file_key() {
        let mut sam = sam();
        let mut fs = FileTree::new();
        let mf = fs.mf();
        fs.plant(
            mf,
            FileNode::transparent(
                FileHeader::new(0x0101, 0x01).with_short_fid(5).unwrap(),
                vec![0x2A; 16],
                None,
            ),
        )
        .unwrap();
        let token = sam
            .cmd_internal_authenticate(0, 0x05, b"challenge", &mut fs)
            .unwrap();
        let expected = tdes::encrypt_cbc(&[0x2A; 16], &pad_iso(b"challenge", 8)).unwrap();
        assert_eq!(token, expected);
    }

    #[test]
    fn test_mse_set_and_unknown_tag() {
        let mut sam = sam();
        let body = TlvBuilder::new().push(0x80, &[0x02]).build();
        sam.cmd_manage_security_environment(0x41, 0xB4, &body).unwrap();
        assert_eq!(
            sam.current_se.checksum.algorithm,
            Some(Algorithm::TdesCbcRetailMac)
        );
        assert!(sam.current_se.require_internal_auth);
        let err = sam
            .cmd_manage_security_environment(0x41, 0xB0, &body)
            .unwrap_err();
        assert_eq!(err.sw, 0x6984);
    }

    #[test]
    fn test_mse_store_restore_erase() {
        let mut sam = sam();
        let body = TlvBuilder::new().push(0x80, &[0x02]).build();
        sam.cmd_manage_security_environment(0x01, 0xB4, &body).unwrap();
        sam.cmd_manage_security_environment(0x02, 0x07, &[]).unwrap();

        // Scribble over the current environment, then restore.
        let body = TlvBuilder::new().push(0x80, &[0x10]).build();
        sam.cmd_manage_security_environment(0x01, 0xB4, &body).unwrap();
        sam.cmd_manage_security_environment(0x03, 0x07, &[]).unwrap();
        assert_eq!(
            sam.current_se.checksum.algorithm,
            Some(Algorithm::TdesCbcRetailMac)
        );

        sam.cmd_manage_security_environment(0x04, 0x07, &[]).unwrap();
        let err = sam
            .cmd_manage_security_environment(0x03, 0x07, &[])
            .unwrap_err();
        assert_eq!(err.sw, 0x6984);
    }

    #[test]
    fn test_pso_unknown_p1p2() {
        let mut sam = sam();
        let err = sam
            .cmd_perform_security_operation(0x12, 0x34, &[])
            .unwrap_err();
        assert_eq!(err.sw, 0x6A86);
    }

    #[test]
    fn test_pso_hash() {
        let mut sam = sam();
        let digest = sam.cmd_perform_security_operation(0x90, 0x80, b"abc").unwrap();
        assert_eq!(digest, crate::crypto::hash::sha256(b"abc"));
    }

    #[test]
    fn test_pso_checksum_round_trip() {
        let mut sam = sam();
        let body = TlvBuilder::new().push(0x80, &[0x02]).build();
        sam.cmd_manage_security_environment(0x01, 0xB4, &body).unwrap();
        sam.current_se.checksum.key = vec![0x31; 16];

        let mac = sam
            .cmd_perform_security_operation(0x8E, 0x80, b"payload")
            .unwrap();
        let verify_body = TlvBuilder::new()
            .push(0x80, b"payload")
            .push(0x8E, &mac)
            .build();
        sam.cmd_perform_security_operation(0x00, 0xA2, &verify_body)
            .unwrap();

        let bad_body = TlvBuilder::new()
            .push(0x80, b"tampered")
            .push(0x8E, &mac)
            .build();
        let err = sam
            .cmd_perform_security_operation(0x00, 0xA2, &bad_body)
            .unwrap_err();
        assert_eq!(err.sw, 0x6988);
    }

    #[test]
    fn test_generate_keypair_and_sign() {
        let mut sam = sam();
        sam.current_se.signature.key_size_bits = 1024;
        let public = sam.cmd_generate_keypair(0x00, 0x00).unwrap();
        let decoded = tlv::decode(&public).unwrap();
        assert_eq!(decoded[0].tag, 0x7F49);
        assert!(decoded[0].child(0x81).is_some());
        assert!(decoded[0].child(0x82).is_some());

        let signature = sam
            .cmd_perform_security_operation(0x9E, 0x9A, &[0x11; 20])
            .unwrap();
        assert_eq!(signature.len(), 128);
        let verify_body = TlvBuilder::new()
            .push(0x80, &[0x11; 20])
            .push(0x9E, &signature)
            .build();
        sam.cmd_perform_security_operation(0x00, 0xA8, &verify_body)
            .unwrap();
    }

    #[test]
    fn test_generate_keypair_suppressed_output() {
        let mut sam = sam();
        sam.current_se.signature.key_size_bits = 1024;
        let out = sam.cmd_generate_keypair(0x01, 0x00).unwrap();
        assert!(out.is_empty());
        assert!(sam.current_se.signature.key_pair.is_some());
    }

    #[test]
    fn test_verify_certificate_stub_stores_chain() {
        let mut sam = sam();
        let cert = encode_certificate(&[0x5F, 0x20, 0x02, 0x44, 0x45]);
        sam.cmd_perform_security_operation(0x00, 0xBE, &cert).unwrap();
        assert_eq!(sam.certificates().len(), 1);
    }
}
