//! vcardos — a software smart card
//!
//! Emulates a contact smart card's chip operating system so that
//! card-aware software (PKI tools, eID middleware, passport readers)
//! can talk to a virtual card without hardware: an ISO 7816-4 command
//! dispatcher over a file-system tree, a security-environment / SAM
//! subsystem with secure messaging, and a shared BER/SIMPLE-TLV codec.
//! Personalities specialize the generic engine into concrete cards
//! (ICAO ePassport with BAC, German eID with PACE/EAC).
//!
//! The reader transport is out of scope; this crate speaks its wire
//! format at the message level: 2-byte big-endian length frames whose
//! 1-byte payloads are control requests (power, reset, ATR) and whose
//! longer payloads are command APDUs.
//!
//! # Example
//! ```ignore
//! use vcardos::{CardEmulator, personality::Personality};
//!
//! let mut card = CardEmulator::new(Personality::blank("demo"));
//! card.process_message(&[vcardos::CTRL_POWER_ON]);
//! let atr = card.process_message(&[vcardos::CTRL_ATR]).unwrap();
//! let response = card.process_message(&[0x00, 0xA4, 0x00, 0x0C]).unwrap();
//! assert_eq!(response, vec![0x90, 0x00]);
//! ```

pub mod apdu;
mod bytes;
pub mod card;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod personality;
pub mod se;
pub mod tlv;

pub use card::CardOs;
pub use error::{CardResult, StructureError, SwError};

use log::{debug, info};

use card::storage::PersistedCard;
use personality::Personality;

/// Control payloads of one-byte frames.
pub const CTRL_POWER_OFF: u8 = 0;
pub const CTRL_POWER_ON: u8 = 1;
pub const CTRL_RESET: u8 = 2;
pub const CTRL_ATR: u8 = 4;

/// A powered card behind the framed reader protocol.
///
/// Owns exactly one [`CardOs`]; the protocol is half-duplex, one
/// message is processed to completion before the next is read, so no
/// locking is involved.
pub struct CardEmulator {
    card: CardOs,
    powered: bool,
}

impl CardEmulator {
    pub fn new(personality: Personality) -> Self {
        Self {
            card: CardOs::new(personality),
            powered: false,
        }
    }

    /// Resume a card from persisted state.
    pub fn from_state(personality: Personality, state: PersistedCard) -> Self {
        Self {
            card: CardOs::with_state(personality, state.fs, state.sam),
            powered: false,
        }
    }

    pub fn card(&self) -> &CardOs {
        &self.card
    }

    pub fn card_mut(&mut self) -> &mut CardOs {
        &mut self.card
    }

    /// The state to hand to a [`card::storage::CardStore`].
    pub fn snapshot(&self) -> PersistedCard {
        PersistedCard {
            fs: self.card.fs.clone(),
            sam: self.card.sam.clone(),
        }
    }

    /// Process one unframed message: a control byte or a command APDU.
    /// Control requests other than ATR have no response frame.
    pub fn process_message(&mut self, message: &[u8]) -> Option<Vec<u8>> {
        if message.len() == 1 {
            match message[0] {
                CTRL_POWER_OFF => {
                    info!("power off");
                    self.powered = false;
                    self.card.reset();
                    None
                }
                CTRL_POWER_ON => {
                    info!("power on");
                    self.powered = true;
                    None
                }
                CTRL_RESET => {
                    info!("reset");
                    self.powered = true;
                    self.card.reset();
                    None
                }
                CTRL_ATR => Some(self.card.atr()),
                other => {
                    debug!("unknown control byte {other:#04x}");
                    None
                }
            }
        } else {
            if !self.powered {
                // Commands before power-on get a cold shoulder, not a
                // dead session.
                return Some(vec![0x6F, 0x00]);
            }
            Some(self.card.process_apdu(message).to_bytes())
        }
    }
}

/// Prefix a payload with its 2-byte big-endian length.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Split one complete frame off a buffer: the payload and the rest.
/// `None` until enough bytes have arrived. A zero-length frame (peer
/// closed) yields an empty payload.
pub fn decode_frame(buffer: &[u8]) -> Option<(&[u8], &[u8])> {
    if buffer.len() < 2 {
        return None;
    }
    let length = u16::from_be_bytes([buffer[0], buffer[1]]) as usize;
    if buffer.len() < 2 + length {
        return None;
    }
    Some((&buffer[2..2 + length], &buffer[2 + length..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn powered_card() -> CardEmulator {
        let mut card = CardEmulator::new(Personality::blank("test"));
        card.process_message(&[CTRL_POWER_ON]);
        card
    }

    #[test]
    fn test_atr_request() {
        let mut card = powered_card();
        let atr = card.process_message(&[CTRL_ATR]).unwrap();
        assert_eq!(atr[0], 0x3B);
    }

    #[test]
    fn test_control_frames_have_no_response() {
        let mut card = CardEmulator::new(Personality::blank("test"));
        assert!(card.process_message(&[CTRL_POWER_ON]).is_none());
        assert!(card.process_message(&[CTRL_RESET]).is_none());
        assert!(card.process_message(&[CTRL_POWER_OFF]).is_none());
    }

    #[test]
    fn test_apdu_cycle() {
        let mut card = powered_card();
        let response = card.process_message(&[0x00, 0xA4, 0x00, 0x0C]).unwrap();
        assert_eq!(response, vec![0x90, 0x00]);
    }

    #[test]
    fn test_unpowered_command_rejected() {
        let mut card = CardEmulator::new(Personality::blank("test"));
        let response = card.process_message(&[0x00, 0xA4, 0x00, 0x0C]).unwrap();
        assert_eq!(response, vec![0x6F, 0x00]);
    }

    #[test]
    fn test_reset_clears_session_state() {
        let mut card = powered_card();
        let mut sam = crate::se::SecureAccessModule::new(
            vec![0x0F; 16],
            b"123456".to_vec(),
            b"87654321".to_vec(),
        );
        std::mem::swap(&mut card.card_mut().sam, &mut sam);
        let mut verify = vec![0x00, 0x20, 0x00, 0x00, 0x06];
        verify.extend(b"123456");
        assert_eq!(card.process_message(&verify).unwrap(), vec![0x90, 0x00]);
        assert!(card.card().sam.is_verified());
        card.process_message(&[CTRL_RESET]);
        assert!(!card.card().sam.is_verified());
        // Persistent state survives the reset.
        assert_eq!(card.card().sam.retries_left(), 3);
    }

    #[test]
    fn test_framing_round_trip() {
        let frame = encode_frame(&[0x00, 0xA4, 0x00, 0x0C]);
        assert_eq!(frame[..2], [0x00, 0x04]);
        let (payload, rest) = decode_frame(&frame).unwrap();
        assert_eq!(payload, &[0x00, 0xA4, 0x00, 0x0C]);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_decode_frame_incomplete() {
        assert!(decode_frame(&[0x00]).is_none());
        assert!(decode_frame(&[0x00, 0x05, 0x01]).is_none());
    }

    #[test]
    fn test_decode_frame_zero_length_means_closed() {
        let (payload, rest) = decode_frame(&[0x00, 0x00, 0xAA]).unwrap();
        assert!(payload.is_empty());
        assert_eq!(rest, &[0xAA]);
    }
}
