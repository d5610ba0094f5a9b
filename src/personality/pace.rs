//! German eID with PACE and Extended Access Control
//!
//! GENERAL AUTHENTICATE drives a strictly ordered step machine over
//! ECDH generic mapping on P-256 with AES-128 session crypto. Terminal
//! and Chip Authentication follow a completed PACE run; Restricted
//! Identification stays a canned stub, as does certificate-chain
//! validation.

use log::debug;
use p256::ProjectivePoint;
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::apdu::{ins, Apdu};
use crate::crypto::{aes, ecdh, kdf};
use crate::error::{CardResult, SwError};
use crate::fs::{FileHeader, FileNode, FileTree};
use crate::personality::{Personality, ProtocolExtension};
use crate::se::sam::{PWD_CAN, PWD_PIN, PWD_PUK};
use crate::se::{
    Algorithm, SecureAccessModule, SessionKeys, OID_PACE_ECDH_GM_AES128,
};
use crate::tlv::{self, Tlv, TlvBuilder};

/// Dynamic authentication template wrapping every GA exchange.
const TAG_DYNAMIC_AUTH: u32 = 0x7C;

/// Canned Restricted Identification value; the original protocol step
/// is not implemented.
const RESTRICTED_ID_STUB: [u8; 32] = [0x5E; 32];

/// Input tag of each GENERAL AUTHENTICATE step.
fn step_for_input(inner: Option<&Tlv>) -> CardResult<u8> {
    match inner.map(|t| t.tag) {
        None => Ok(0),
        Some(0x81) => Ok(1),
        Some(0x83) => Ok(2),
        Some(0x85) => Ok(3),
        Some(0x80) => Ok(5),
        Some(0xA0) | Some(0xA2) => Ok(6),
        Some(_) => Err(SwError::wrong_data()),
    }
}

/// The TR-03110 ephemeral public key encoding MACed into the mutual
/// authentication tokens.
fn token_input(point: &ProjectivePoint) -> Vec<u8> {
    TlvBuilder::new()
        .push(0x06, OID_PACE_ECDH_GM_AES128)
        .push(0x86, &ecdh::encode_point(point))
        .wrap(0x7F49)
        .build()
}

fn wrap_dynamic(objects: TlvBuilder) -> Vec<u8> {
    objects.wrap(TAG_DYNAMIC_AUTH).build()
}

/// Per-session PACE/EAC protocol state.
#[derive(Default)]
struct PaceState {
    /// Next expected GA step; 4 means "PACE done, TA/CA phase".
    next_step: u8,
    password_id: u8,
    nonce: Option<p256::Scalar>,
    map_key: Option<ecdh::KeyPair>,
    mapped_generator: Option<ProjectivePoint>,
    eph_key: Option<ecdh::KeyPair>,
    terminal_eph: Option<ProjectivePoint>,
    kenc: Vec<u8>,
    kmac: Vec<u8>,
    /// Chip identifier derived from the PACE ephemeral key.
    id_picc: Vec<u8>,
    ta_done: bool,
}

/// PACE/EAC protocol hook.
pub struct PaceExtension {
    /// Certification authority reference emitted after PACE when
    /// terminal authentication is expected.
    ca_reference: Option<Vec<u8>>,
    /// Static chip authentication key pair.
    ca_key: ecdh::KeyPair,
    state: PaceState,
}

impl PaceExtension {
    pub fn new(ca_reference: Option<Vec<u8>>) -> Self {
        Self {
            ca_reference,
            ca_key: ecdh::generate_keypair(&ProjectivePoint::GENERATOR),
            state: PaceState::default(),
        }
    }

    fn abort(&mut self) {
        self.state = PaceState::default();
    }

    /// Step 0: select the secret, mint and encrypt the nonce, start
    /// fresh domain parameters. Always allowed; restarts the machine.
    fn step_select(&mut self, sam: &mut SecureAccessModule) -> CardResult<Vec<u8>> {
        self.abort();
        let at = &sam.current_se.authentication;
        if at.algorithm != Some(Algorithm::Pace) && at.algorithm != Some(Algorithm::TerminalAuth) {
            return Err(SwError::conditions_not_satisfied());
        }
        let password_id = at
            .key_reference
            .ok_or_else(SwError::reference_not_usable)?;
        let password = sam.password(password_id)?.to_vec();
        let k_pi = kdf::password_key(&password);

        let mut nonce = [0u8; 16];
        OsRng.fill_bytes(&mut nonce);
        let encrypted = aes::encrypt_cbc(&k_pi, &[0u8; aes::BLOCK_SIZE], &nonce)
            .map_err(|_| SwError::reference_not_usable())?;

        self.state.password_id = password_id;
        self.state.nonce = Some(
            ecdh::scalar_from_bytes(&nonce).map_err(|_| SwError::generic_warning())?,
        );
        self.state.map_key = Some(ecdh::generate_keypair(&ProjectivePoint::GENERATOR));
        self.state.next_step = 1;
        debug!("PACE started with password reference {password_id}");
        Ok(wrap_dynamic(TlvBuilder::new().push(0x80, &encrypted)))
    }

    /// Step 1: consume the terminal's mapping contribution, derive the
    /// card's mapped generator, answer with the card's mapping key.
    fn step_map(&mut self, input: &Tlv) -> CardResult<Vec<u8>> {
        let terminal_map = ecdh::decode_point(&input.value)
            .map_err(|_| SwError::wrong_data())?;
        let map_key = self.state.map_key.as_ref().ok_or_else(SwError::conditions_not_satisfied)?;
        let nonce = self.state.nonce.as_ref().ok_or_else(SwError::conditions_not_satisfied)?;
        let h = ecdh::shared_point(&map_key.secret, &terminal_map)
            .map_err(|_| SwError::wrong_data())?;
        self.state.mapped_generator = Some(ecdh::map_generator(nonce, &h));
        let public = ecdh::encode_point(&map_key.public);
        self.state.next_step = 2;
        Ok(wrap_dynamic(TlvBuilder::new().push(0x82, &public)))
    }

    /// Step 2: consume the terminal's ephemeral key, generate the
    /// card's pair over the mapped generator, agree on the shared
    /// secret and derive session key candidates.
    fn step_agree(&mut self, input: &Tlv) -> CardResult<Vec<u8>> {
        let generator = self
            .state
            .mapped_generator
            .ok_or_else(SwError::conditions_not_satisfied)?;
        let terminal_eph = ecdh::decode_point(&input.value)
            .map_err(|_| SwError::wrong_data())?;
        let eph_key = ecdh::generate_keypair(&generator);
        if terminal_eph == eph_key.public {
            return Err(SwError::wrong_data());
        }
        let shared = ecdh::shared_point(&eph_key.secret, &terminal_eph)
            .map_err(|_| SwError::wrong_data())?;
        let secret = ecdh::x_coordinate(&shared);
        self.state.kenc = kdf::derive(&secret, kdf::CTR_ENC, kdf::KeyTarget::Aes128);
        self.state.kmac = kdf::derive(&secret, kdf::CTR_MAC, kdf::KeyTarget::Aes128);
        let public = ecdh::encode_point(&eph_key.public);
        self.state.eph_key = Some(eph_key);
        self.state.terminal_eph = Some(terminal_eph);
        self.state.next_step = 3;
        Ok(wrap_dynamic(TlvBuilder::new().push(0x84, &public)))
    }

    /// Step 3: verify the terminal's authentication token, answer with
    /// the card's, switch to session keys and the TA phase.
    fn step_tokens(
        &mut self,
        input: &Tlv,
        sam: &mut SecureAccessModule,
    ) -> CardResult<Vec<u8>> {
        let eph_key = self.state.eph_key.as_ref().ok_or_else(SwError::conditions_not_satisfied)?;
        let terminal_eph = self
            .state
            .terminal_eph
            .ok_or_else(SwError::conditions_not_satisfied)?;
        let expected = aes::cmac8(&self.state.kmac, &token_input(&eph_key.public))
            .map_err(|_| SwError::generic_warning())?;
        if expected.ct_eq(&input.value).unwrap_u8() != 1 {
            debug!("PACE terminal token mismatch");
            if self.state.password_id == PWD_PIN {
                sam.penalize_pin();
            }
            self.abort();
            // Deliberately generic: no oracle about which check failed.
            return Err(SwError::generic_warning());
        }
        let token = aes::cmac8(&self.state.kmac, &token_input(&terminal_eph))
            .map_err(|_| SwError::generic_warning())?;

        sam.current_se.install_session_keys(&SessionKeys {
            algorithm: Algorithm::Aes128CbcCmac,
            enc: self.state.kenc.clone(),
            mac: self.state.kmac.clone(),
            ssc: vec![0u8; 16],
        });
        // PACE is done; the authentication template now runs terminal
        // authentication.
        sam.current_se.authentication.algorithm = Some(Algorithm::TerminalAuth);
        // Success over CAN or PUK reactivates a suspended PIN; success
        // over the PIN itself restores its counter.
        if matches!(self.state.password_id, PWD_CAN | PWD_PUK | PWD_PIN) {
            sam.restore_pin();
        }
        self.state.id_picc = ecdh::x_coordinate(&eph_key.public);
        self.state.next_step = 4;
        debug!("PACE established, switching to TA phase");

        let mut reply = TlvBuilder::new().push(0x86, &token);
        if let Some(car) = &self.ca_reference {
            reply = reply.push(0x87, car);
        }
        Ok(wrap_dynamic(reply))
    }

    /// Step 4, terminal authentication: the terminal signs the
    /// challenge, the chip identifier and any auxiliary data. The
    /// certificate chain was imported through PSO VERIFY CERTIFICATE;
    /// chain and signature validation are not performed here.
    fn terminal_authenticate(
        &mut self,
        apdu: &Apdu,
        sam: &mut SecureAccessModule,
    ) -> CardResult<Vec<u8>> {
        if self.state.next_step != 4 || self.state.ta_done {
            return Err(SwError::conditions_not_satisfied());
        }
        let _challenge = sam
            .take_challenge()
            .ok_or_else(SwError::conditions_not_satisfied)?;
        if sam.certificates().is_empty() || apdu.data.is_empty() {
            return Err(SwError::conditions_not_satisfied());
        }
        self.state.ta_done = true;
        debug!("terminal authentication accepted");
        Ok(Vec::new())
    }

    /// Step 5, chip authentication: agree on a fresh secret with the
    /// card's static key and arm the deferred switch to CA session
    /// keys.
    fn chip_authenticate(
        &mut self,
        input: &Tlv,
        sam: &mut SecureAccessModule,
    ) -> CardResult<Vec<u8>> {
        if self.state.next_step != 4 || !self.state.ta_done {
            return Err(SwError::conditions_not_satisfied());
        }
        let terminal_eph = ecdh::decode_point(&input.value)
            .map_err(|_| SwError::wrong_data())?;
        let shared = ecdh::shared_point(&self.ca_key.secret, &terminal_eph)
            .map_err(|_| SwError::wrong_data())?;
        let secret = ecdh::x_coordinate(&shared);
        let enc = kdf::derive(&secret, kdf::CTR_ENC, kdf::KeyTarget::Aes128);
        let mac = kdf::derive(&secret, kdf::CTR_MAC, kdf::KeyTarget::Aes128);

        let mut nonce = [0u8; 8];
        OsRng.fill_bytes(&mut nonce);
        let token = aes::cmac8(&mac, &token_input(&terminal_eph))
            .map_err(|_| SwError::generic_warning())?;

        // The switch happens on the next secure-messaging operation,
        // so this response still travels under the PACE keys.
        sam.current_se.defer_session_keys(SessionKeys {
            algorithm: Algorithm::Aes128CbcCmac,
            enc,
            mac,
            ssc: vec![0u8; 16],
        });
        self.state.next_step = 5;
        debug!("chip authentication complete, CA keys armed");
        Ok(wrap_dynamic(
            TlvBuilder::new().push(0x81, &nonce).push(0x82, &token),
        ))
    }

    /// Step 6: Restricted Identification, a canned value.
    fn restricted_identification(&mut self) -> CardResult<Vec<u8>> {
        if self.state.next_step < 4 {
            return Err(SwError::conditions_not_satisfied());
        }
        Ok(wrap_dynamic(
            TlvBuilder::new().push(0x81, &RESTRICTED_ID_STUB),
        ))
    }

    fn general_authenticate(
        &mut self,
        apdu: &Apdu,
        sam: &mut SecureAccessModule,
    ) -> CardResult<Vec<u8>> {
        let objects = tlv::decode(&apdu.data).map_err(|_| SwError::wrong_data())?;
        let wrapper = tlv::find_first(&objects, TAG_DYNAMIC_AUTH)
            .ok_or_else(SwError::wrong_data)?;
        let inner = wrapper.children.first();
        let step = step_for_input(inner)?;

        // Strict ordering: starting over is always allowed, everything
        // else must be the expected step.
        match step {
            0 => self.step_select(sam),
            1 | 2 | 3 if step != self.state.next_step => {
                debug!(
                    "PACE step {step} out of order, expected {}",
                    self.state.next_step
                );
                Err(SwError::conditions_not_satisfied())
            }
            1 => self.step_map(wrapper.children.first().ok_or_else(SwError::wrong_data)?),
            2 => self.step_agree(wrapper.children.first().ok_or_else(SwError::wrong_data)?),
            3 => self.step_tokens(
                wrapper.children.first().ok_or_else(SwError::wrong_data)?,
                sam,
            ),
            5 => self.chip_authenticate(
                wrapper.children.first().ok_or_else(SwError::wrong_data)?,
                sam,
            ),
            6 => self.restricted_identification(),
            _ => Err(SwError::conditions_not_satisfied()),
        }
    }
}

impl ProtocolExtension for PaceExtension {
    fn handles(&self, apdu: &Apdu) -> bool {
        apdu.ins == ins::GENERAL_AUTHENTICATE
            || (apdu.ins == ins::EXTERNAL_AUTHENTICATE
                && self.state.next_step == 4
                && !self.state.ta_done)
    }

    fn dispatch(
        &mut self,
        apdu: &Apdu,
        _fs: &mut FileTree,
        sam: &mut SecureAccessModule,
    ) -> CardResult<Vec<u8>> {
        match apdu.ins {
            ins::GENERAL_AUTHENTICATE => self.general_authenticate(apdu, sam),
            ins::EXTERNAL_AUTHENTICATE => self.terminal_authenticate(apdu, sam),
            _ => Err(SwError::instruction_not_supported()),
        }
    }

    fn reset_session(&mut self) {
        self.abort();
    }
}

/// EF.CardAccess content advertising the PACE parameters.
fn card_access_bytes() -> Vec<u8> {
    // SET OF one PACEInfo: OID, version 2, parameter id 12 (P-256).
    TlvBuilder::new()
        .push_raw(
            &TlvBuilder::new()
                .push(0x06, OID_PACE_ECDH_GM_AES128)
                .push(0x02, &[0x02])
                .push(0x02, &[0x0C])
                .wrap(0x30)
                .build(),
        )
        .wrap(0x31)
        .build()
}

/// A German-eID-style personality: PACE over PIN/CAN/PUK, EAC hooks,
/// EF.CardAccess seeded under the MF.
pub fn german_eid(
    pin: Vec<u8>,
    can: Vec<u8>,
    puk: Vec<u8>,
    ca_reference: Option<Vec<u8>>,
) -> Personality {
    let extension = PaceExtension::new(ca_reference);
    Personality::blank("german-eid")
        .with_seeder(Box::new(move |fs, sam| {
            let mut seeded =
                SecureAccessModule::new(Vec::new(), pin.clone(), puk.clone());
            seeded.set_can(can.clone());
            *sam = seeded;
            let mf = fs.mf();
            let card_access = FileNode::transparent(
                FileHeader::new(0x011C, 0x01)
                    .with_short_fid(0x1C)
                    .expect("static short fid"),
                card_access_bytes(),
                None,
            );
            fs.plant(mf, card_access).expect("fresh tree");
        }))
        .with_extension(Box::new(extension))
}
