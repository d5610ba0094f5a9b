//! Security environments and control reference templates
//!
//! A security environment is the card's per-operation crypto
//! configuration: six control reference templates plus flags saying
//! which of them secure messaging and authentication draw from. The
//! SAM owns the current environment and a snapshot map for MANAGE
//! SECURITY ENVIRONMENT's STORE/RESTORE/ERASE.

pub mod sam;
pub mod sm;

pub use sam::SecureAccessModule;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{CardResult, SwError};
use crate::tlv::Tlv;

/// Algorithms referenced by CRTs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    /// Two-key 3DES-CBC with retail MAC (BAC sessions).
    TdesCbcRetailMac,
    /// AES-128-CBC with CMAC (PACE sessions).
    Aes128CbcCmac,
    /// RSA with PKCS#1 v1.5 padding.
    RsaPkcs1,
    /// PACE key establishment, before session keys exist.
    Pace,
    /// Terminal Authentication, after a completed PACE run.
    TerminalAuth,
    /// Chip Authentication.
    ChipAuth,
}

/// The PACE-ECDH-GM-AES-CBC-CMAC-128 object identifier
/// (0.4.0.127.0.7.2.2.4.2.2).
pub const OID_PACE_ECDH_GM_AES128: &[u8] =
    &[0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x04, 0x02, 0x02];

/// Immutable algorithm reference table: maps the reference bytes
/// carried in an MSE SET 0x80 object onto an algorithm.
static ALGORITHMS: Lazy<Vec<(&'static [u8], Algorithm)>> = Lazy::new(|| {
    vec![
        (&[0x01][..], Algorithm::RsaPkcs1),
        (&[0x02][..], Algorithm::TdesCbcRetailMac),
        (&[0x10][..], Algorithm::Aes128CbcCmac),
        (OID_PACE_ECDH_GM_AES128, Algorithm::Pace),
    ]
});

/// Resolve an algorithm reference; `None` for unknown bytes.
pub fn lookup_algorithm(reference: &[u8]) -> Option<Algorithm> {
    ALGORITHMS
        .iter()
        .find(|(bytes, _)| *bytes == reference)
        .map(|(_, algorithm)| *algorithm)
}

/// The six control reference template kinds and their MSE SET P2 tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrtKind {
    Authentication,
    KeyAgreement,
    Hash,
    ChecksumComputation,
    DigitalSignature,
    Confidentiality,
}

impl CrtKind {
    pub fn from_tag(tag: u8) -> CardResult<Self> {
        match tag {
            0xA4 => Ok(CrtKind::Authentication),
            0xA6 => Ok(CrtKind::KeyAgreement),
            0xAA => Ok(CrtKind::Hash),
            0xB4 => Ok(CrtKind::ChecksumComputation),
            0xB6 => Ok(CrtKind::DigitalSignature),
            0xB8 => Ok(CrtKind::Confidentiality),
            _ => Err(SwError::reference_not_usable()),
        }
    }
}

/// An RSA key pair in storable component form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredKeyPair {
    #[serde(with = "crate::bytes")]
    pub modulus: Vec<u8>,
    #[serde(with = "crate::bytes")]
    pub public_exponent: Vec<u8>,
    #[serde(with = "crate::bytes")]
    pub private_exponent: Vec<u8>,
    pub primes: Vec<Vec<u8>>,
}

impl StoredKeyPair {
    pub fn from_key(key: &rsa::RsaPrivateKey) -> Self {
        use rsa::traits::{PrivateKeyParts, PublicKeyParts};
        Self {
            modulus: key.n().to_bytes_be(),
            public_exponent: key.e().to_bytes_be(),
            private_exponent: key.d().to_bytes_be(),
            primes: key.primes().iter().map(|p| p.to_bytes_be()).collect(),
        }
    }

    pub fn to_key(&self) -> CardResult<rsa::RsaPrivateKey> {
        use rsa::BigUint;
        rsa::RsaPrivateKey::from_components(
            BigUint::from_bytes_be(&self.modulus),
            BigUint::from_bytes_be(&self.public_exponent),
            BigUint::from_bytes_be(&self.private_exponent),
            self.primes
                .iter()
                .map(|p| BigUint::from_bytes_be(p))
                .collect(),
        )
        .map_err(|_| SwError::reference_not_usable())
    }

    pub fn public_key(&self) -> CardResult<rsa::RsaPublicKey> {
        use rsa::BigUint;
        rsa::RsaPublicKey::new(
            BigUint::from_bytes_be(&self.modulus),
            BigUint::from_bytes_be(&self.public_exponent),
        )
        .map_err(|_| SwError::reference_not_usable())
    }
}

/// One control reference template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crt {
    pub kind: CrtKind,
    pub algorithm: Option<Algorithm>,
    /// Raw algorithm reference bytes as set over the wire.
    #[serde(with = "crate::bytes")]
    pub algorithm_ref: Vec<u8>,
    /// Symmetric key material.
    #[serde(with = "crate::bytes")]
    pub key: Vec<u8>,
    /// Key reference byte (a password id, a private key number).
    pub key_reference: Option<u8>,
    /// Asymmetric key pair, where the template holds one.
    pub key_pair: Option<StoredKeyPair>,
    /// Initial value for chaining modes.
    #[serde(with = "crate::bytes")]
    pub iv: Vec<u8>,
    /// Send sequence counter for secure messaging.
    #[serde(with = "crate::bytes")]
    pub ssc: Vec<u8>,
    pub block_length: usize,
    pub usage_qualifier: u8,
    /// Modulus size used by GENERATE PUBLIC KEY PAIR.
    pub key_size_bits: usize,
}

impl Crt {
    pub fn new(kind: CrtKind) -> Self {
        Self {
            kind,
            algorithm: None,
            algorithm_ref: Vec::new(),
            key: Vec::new(),
            key_reference: None,
            key_pair: None,
            iv: Vec::new(),
            ssc: Vec::new(),
            block_length: 8,
            usage_qualifier: 0,
            key_size_bits: 1024,
        }
    }

    /// Update from the data objects of an MSE SET command body.
    pub fn update_from(&mut self, objects: &[Tlv]) -> CardResult<()> {
        for object in objects {
            match object.tag {
                0x80 => {
                    self.algorithm_ref = object.value.clone();
                    self.algorithm = lookup_algorithm(&object.value);
                }
                0x83 | 0x84 => {
                    let reference = *object
                        .value
                        .first()
                        .ok_or_else(SwError::wrong_data)?;
                    self.key_reference = Some(reference);
                }
                0x87 => self.iv = object.value.clone(),
                0x91 => self.ssc = object.value.clone(),
                0x95 => {
                    self.usage_qualifier =
                        *object.value.first().ok_or_else(SwError::wrong_data)?;
                }
                // Unknown objects are tolerated but not interpreted.
                _ => {}
            }
        }
        Ok(())
    }
}

/// Session keys installed into an SE after key establishment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKeys {
    pub algorithm: Algorithm,
    #[serde(with = "crate::bytes")]
    pub enc: Vec<u8>,
    #[serde(with = "crate::bytes")]
    pub mac: Vec<u8>,
    #[serde(with = "crate::bytes")]
    pub ssc: Vec<u8>,
}

/// A security environment: the six CRTs plus scope flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEnvironment {
    /// Reference id used by MSE STORE/RESTORE/ERASE.
    pub reference: u8,
    pub authentication: Crt,
    pub key_agreement: Crt,
    pub hash: Crt,
    pub checksum: Crt,
    pub signature: Crt,
    pub confidentiality: Crt,
    /// Secure messaging applies to commands.
    pub sm_command: bool,
    /// Secure messaging applies to responses.
    pub sm_response: bool,
    pub require_internal_auth: bool,
    pub require_external_auth: bool,
    /// Session keys armed for a deferred one-time switch (chip
    /// authentication hands over to CA keys on the next SM operation).
    pub deferred_keys: Option<SessionKeys>,
}

impl SecurityEnvironment {
    pub fn new(reference: u8) -> Self {
        Self {
            reference,
            authentication: Crt::new(CrtKind::Authentication),
            key_agreement: Crt::new(CrtKind::KeyAgreement),
            hash: Crt::new(CrtKind::Hash),
            checksum: Crt::new(CrtKind::ChecksumComputation),
            signature: Crt::new(CrtKind::DigitalSignature),
            confidentiality: Crt::new(CrtKind::Confidentiality),
            sm_command: false,
            sm_response: false,
            require_internal_auth: false,
            require_external_auth: false,
            deferred_keys: None,
        }
    }

    pub fn crt(&self, kind: CrtKind) -> &Crt {
        match kind {
            CrtKind::Authentication => &self.authentication,
            CrtKind::KeyAgreement => &self.key_agreement,
            CrtKind::Hash => &self.hash,
            CrtKind::ChecksumComputation => &self.checksum,
            CrtKind::DigitalSignature => &self.signature,
            CrtKind::Confidentiality => &self.confidentiality,
        }
    }

    pub fn crt_mut(&mut self, kind: CrtKind) -> &mut Crt {
        match kind {
            CrtKind::Authentication => &mut self.authentication,
            CrtKind::KeyAgreement => &mut self.key_agreement,
            CrtKind::Hash => &mut self.hash,
            CrtKind::ChecksumComputation => &mut self.checksum,
            CrtKind::DigitalSignature => &mut self.signature,
            CrtKind::Confidentiality => &mut self.confidentiality,
        }
    }

    /// Apply the scope bits from MSE's P1 high nibble.
    pub fn apply_scope(&mut self, p1: u8) {
        if p1 & 0x10 != 0 {
            self.sm_command = true;
        }
        if p1 & 0x20 != 0 {
            self.sm_response = true;
        }
        if p1 & 0x40 != 0 {
            self.require_internal_auth = true;
        }
        if p1 & 0x80 != 0 {
            self.require_external_auth = true;
        }
    }

    /// Install session keys into the checksum and confidentiality
    /// templates; secure messaging is live from the next command.
    pub fn install_session_keys(&mut self, keys: &SessionKeys) {
        let block = match keys.algorithm {
            Algorithm::TdesCbcRetailMac => 8,
            _ => 16,
        };
        self.checksum.algorithm = Some(keys.algorithm);
        self.checksum.key = keys.mac.clone();
        self.checksum.ssc = keys.ssc.clone();
        self.checksum.block_length = block;
        self.confidentiality.algorithm = Some(keys.algorithm);
        self.confidentiality.key = keys.enc.clone();
        self.confidentiality.block_length = block;
        self.sm_command = true;
        self.sm_response = true;
    }

    /// Arm keys for the deferred one-time switch.
    pub fn defer_session_keys(&mut self, keys: SessionKeys) {
        self.deferred_keys = Some(keys);
    }

    /// Secure messaging is configured and usable.
    pub fn sm_available(&self) -> bool {
        self.checksum.algorithm.is_some() && !self.checksum.key.is_empty()
    }
}
