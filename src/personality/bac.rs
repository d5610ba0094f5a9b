//! ICAO ePassport with Basic Access Control
//!
//! The two-message analogue of PACE: one EXTERNAL AUTHENTICATE carries
//! the terminal's encrypted nonce/key material, the card answers with
//! its own, and both sides derive 3DES session keys plus a send
//! sequence counter from the exchanged halves.

use log::debug;
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::apdu::{ins, Apdu};
use crate::crypto::{kdf, tdes};
use crate::error::{CardResult, SwError};
use crate::fs::{FileHeader, FileNode, FileTree};
use crate::personality::{Personality, ProtocolExtension};
use crate::se::{Algorithm, SecureAccessModule, SessionKeys};

/// ICAO LDS application identifier.
pub const AID_LDS: &[u8] = &[0xA0, 0x00, 0x00, 0x02, 0x47, 0x10, 0x01];

/// The MRZ information a BAC passport is keyed on: document number,
/// birth date and expiry date, each followed by its check digit.
#[derive(Debug, Clone)]
pub struct MrzInfo(pub Vec<u8>);

impl MrzInfo {
    pub fn new(document_number: &str, birth_date: &str, expiry_date: &str) -> Self {
        let mut info = Vec::new();
        for field in [document_number, birth_date, expiry_date] {
            info.extend_from_slice(field.as_bytes());
            info.push(check_digit(field.as_bytes()));
        }
        Self(info)
    }
}

/// ICAO 9303 check digit over the 7-3-1 weighting.
fn check_digit(field: &[u8]) -> u8 {
    const WEIGHTS: [u32; 3] = [7, 3, 1];
    let sum: u32 = field
        .iter()
        .enumerate()
        .map(|(index, &byte)| {
            let value = match byte {
                b'0'..=b'9' => (byte - b'0') as u32,
                b'A'..=b'Z' => (byte - b'A') as u32 + 10,
                _ => 0,
            };
            value * WEIGHTS[index % 3]
        })
        .sum();
    b'0' + (sum % 10) as u8
}

/// BAC protocol hook: intercepts the 40-byte EXTERNAL AUTHENTICATE.
pub struct BacExtension {
    kenc: Vec<u8>,
    kmac: Vec<u8>,
}

impl BacExtension {
    pub fn new(mrz: &MrzInfo) -> Self {
        let seed = kdf::mrz_seed(&mrz.0);
        Self {
            kenc: kdf::derive(&seed, kdf::CTR_ENC, kdf::KeyTarget::Tdes2Key),
            kmac: kdf::derive(&seed, kdf::CTR_MAC, kdf::KeyTarget::Tdes2Key),
        }
    }

    /// One round of mutual authentication. The command carries
    /// E_ifd (32) and its retail MAC (8); the response mirrors the
    /// structure with the card's material.
    fn mutual_authenticate(
        &mut self,
        data: &[u8],
        sam: &mut SecureAccessModule,
    ) -> CardResult<Vec<u8>> {
        let rnd_icc = sam
            .take_challenge()
            .ok_or_else(SwError::conditions_not_satisfied)?;
        if rnd_icc.len() != 8 || data.len() != 40 {
            return Err(SwError::wrong_length());
        }
        let (e_ifd, m_ifd) = data.split_at(32);

        let expected = tdes::retail_mac(&self.kmac, e_ifd)
            .map_err(|_| SwError::generic_warning())?;
        if expected.ct_eq(m_ifd).unwrap_u8() != 1 {
            debug!("BAC terminal checksum mismatch");
            return Err(SwError::generic_warning());
        }

        let s = tdes::decrypt_cbc(&self.kenc, e_ifd)
            .map_err(|_| SwError::generic_warning())?;
        let rnd_ifd = &s[..8];
        if s[8..16].ct_eq(&rnd_icc).unwrap_u8() != 1 {
            debug!("BAC challenge mismatch");
            return Err(SwError::generic_warning());
        }
        let k_ifd = &s[16..32];

        let mut k_icc = [0u8; 16];
        OsRng.fill_bytes(&mut k_icc);

        let mut r = Vec::with_capacity(32);
        r.extend_from_slice(&rnd_icc);
        r.extend_from_slice(rnd_ifd);
        r.extend_from_slice(&k_icc);
        let e_icc = tdes::encrypt_cbc(&self.kenc, &r)
            .map_err(|_| SwError::generic_warning())?;
        let m_icc = tdes::retail_mac(&self.kmac, &e_icc)
            .map_err(|_| SwError::generic_warning())?;

        // Session keys from the XOR of both key halves; the counter
        // starts from the trailing nonce halves.
        let seed: Vec<u8> = k_ifd
            .iter()
            .zip(k_icc.iter())
            .map(|(a, b)| a ^ b)
            .collect();
        let mut ssc = Vec::with_capacity(8);
        ssc.extend_from_slice(&rnd_icc[4..]);
        ssc.extend_from_slice(&rnd_ifd[4..]);
        sam.current_se.install_session_keys(&SessionKeys {
            algorithm: Algorithm::TdesCbcRetailMac,
            enc: kdf::derive(&seed, kdf::CTR_ENC, kdf::KeyTarget::Tdes2Key),
            mac: kdf::derive(&seed, kdf::CTR_MAC, kdf::KeyTarget::Tdes2Key),
            ssc,
        });
        debug!("BAC session established");

        let mut out = e_icc;
        out.extend_from_slice(&m_icc);
        Ok(out)
    }
}

impl ProtocolExtension for BacExtension {
    fn handles(&self, apdu: &Apdu) -> bool {
        apdu.ins == ins::EXTERNAL_AUTHENTICATE
            && apdu.p1 == 0x00
            && apdu.p2 == 0x00
            && apdu.data.len() == 40
    }

    fn dispatch(
        &mut self,
        apdu: &Apdu,
        _fs: &mut FileTree,
        sam: &mut SecureAccessModule,
    ) -> CardResult<Vec<u8>> {
        self.mutual_authenticate(&apdu.data, sam)
    }
}

/// An ePassport personality: LDS file tree seeded with the data
/// groups, MRZ-derived SAM secrets, BAC hook installed.
pub fn epassport(mrz: MrzInfo, dg1_mrz_bytes: Vec<u8>) -> Personality {
    let extension = BacExtension::new(&mrz);
    let mrz_password = mrz.0.clone();
    Personality::blank("icao-epassport")
        .with_seeder(Box::new(move |fs, sam| {
            sam.set_mrz_password(mrz_password);
            let mf = fs.mf();
            // Structural failures at personalization are implementation
            // bugs, not protocol errors.
            let lds = fs
                .plant(
                    mf,
                    FileNode::dedicated(FileHeader::new(0x1001, 0x38), Some(AID_LDS.to_vec()))
                        .expect("LDS application name"),
                )
                .expect("fresh tree");
            let com = FileNode::transparent(
                header_with_sfid(0x011E, 0x1E),
                vec![0x60, 0x00],
                None,
            );
            let dg1 = FileNode::transparent(header_with_sfid(0x0101, 0x01), dg1_mrz_bytes, None);
            for node in [com, dg1] {
                fs.plant(lds, node).expect("unique data group fids");
            }
        }))
        .with_extension(Box::new(extension))
}

fn header_with_sfid(fid: u16, sfid: u8) -> FileHeader {
    match FileHeader::new(fid, 0x01).with_short_fid(sfid) {
        Ok(header) => header,
        Err(_) => FileHeader::new(fid, 0x01),
    }
}
