//! Command and response APDUs
//!
//! Parses raw command bytes into an [`Apdu`] (all four ISO 7816-4 cases,
//! short and extended), decodes the class byte into channel, secure
//! messaging mode and chaining flag, and provides the [`Response`] type
//! and status-word constants used by every handler.

mod response;
mod status;

pub use response::Response;
pub use status::SW;

use thiserror::Error;

/// Errors raised while parsing a raw command APDU.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApduError {
    #[error("APDU too short: expected at least 4 bytes, got {0}")]
    TooShort(usize),

    #[error("length fields inconsistent with APDU size")]
    InvalidLength,

    #[error("invalid extended length encoding")]
    InvalidExtendedFormat,
}

/// Secure-messaging indication carried in the class byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SmMode {
    /// No secure messaging.
    #[default]
    None,
    /// Proprietary secure messaging.
    Proprietary,
    /// Standard secure messaging, command header not authenticated.
    Standard,
    /// Standard secure messaging including header authentication.
    StandardHeaderAuth,
}

impl SmMode {
    pub fn is_active(self) -> bool {
        !matches!(self, SmMode::None)
    }

    pub fn authenticates_header(self) -> bool {
        matches!(self, SmMode::StandardHeaderAuth)
    }
}

/// Decoded class byte.
///
/// The first-industry layout (bits 8-6 zero) carries a two-bit channel,
/// a two-bit SM mode and the chaining flag; the further-industry layout
/// (bits 8-7 = 01) extends the channel range to 4..19 with a single
/// standard-SM flag. Anything else is treated as a legacy class with no
/// secure messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassByte {
    pub raw: u8,
    pub channel: u8,
    pub sm: SmMode,
    pub chaining: bool,
}

impl ClassByte {
    pub fn decode(cla: u8) -> Self {
        if cla & 0xE0 == 0x00 {
            // First industry: b8-b6 zero, b5 chaining, b4-b3 SM, b2-b1 channel.
            let sm = match (cla >> 2) & 0x03 {
                0 => SmMode::None,
                1 => SmMode::Proprietary,
                2 => SmMode::Standard,
                _ => SmMode::StandardHeaderAuth,
            };
            Self {
                raw: cla,
                channel: cla & 0x03,
                sm,
                chaining: cla & 0x10 != 0,
            }
        } else if cla & 0xC0 == 0x40 {
            // Further industry: b8-b7 = 01, b6 SM, b5 chaining, b4-b1 channel - 4.
            let sm = if cla & 0x20 != 0 {
                SmMode::Standard
            } else {
                SmMode::None
            };
            Self {
                raw: cla,
                channel: 4 + (cla & 0x0F),
                sm,
                chaining: cla & 0x10 != 0,
            }
        } else {
            // Unrecognized pattern: legacy compatibility, no SM assumed.
            Self {
                raw: cla,
                channel: 0,
                sm: SmMode::None,
                chaining: false,
            }
        }
    }
}

/// A parsed command APDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    /// Command body; empty when absent.
    pub data: Vec<u8>,
    /// Expected response length; `None` when absent, 0 is never stored
    /// (the wire value 0 decodes to 256 or 65536).
    pub le: Option<u32>,
}

impl Apdu {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            le: None,
        }
    }

    pub fn with_data(cla: u8, ins: u8, p1: u8, p2: u8, data: Vec<u8>) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data,
            le: None,
        }
    }

    /// Decoded view of the class byte.
    pub fn class(&self) -> ClassByte {
        ClassByte::decode(self.cla)
    }

    /// P1 and P2 combined, for (P1,P2)-multiplexed instructions.
    pub fn p1p2(&self) -> u16 {
        ((self.p1 as u16) << 8) | (self.p2 as u16)
    }

    /// The four header bytes, as authenticated under secure messaging.
    pub fn header(&self) -> [u8; 4] {
        [self.cla, self.ins, self.p1, self.p2]
    }
}

/// Parse raw bytes into an [`Apdu`].
///
/// Handles case 1 (header only), case 2 (Le), case 3 (Lc + data) and
/// case 4 (Lc + data + Le) in both short and extended form. Extended
/// form is recognized by the 0x00 marker byte after the header.
pub fn parse_apdu(raw: &[u8]) -> Result<Apdu, ApduError> {
    if raw.len() < 4 {
        return Err(ApduError::TooShort(raw.len()));
    }
    let (cla, ins, p1, p2) = (raw[0], raw[1], raw[2], raw[3]);
    let rest = &raw[4..];

    if rest.is_empty() {
        return Ok(Apdu::new(cla, ins, p1, p2));
    }

    if rest[0] == 0x00 && rest.len() > 1 {
        // Candidate extended encoding: 00 then two-byte fields.
        if let Ok(apdu) = parse_extended(cla, ins, p1, p2, &rest[1..]) {
            return Ok(apdu);
        }
    }

    parse_short(cla, ins, p1, p2, rest)
}

fn parse_short(cla: u8, ins: u8, p1: u8, p2: u8, rest: &[u8]) -> Result<Apdu, ApduError> {
    // Case 2: a single Le byte, 0 meaning 256.
    if rest.len() == 1 {
        let le = if rest[0] == 0 { 256 } else { rest[0] as u32 };
        return Ok(Apdu {
            le: Some(le),
            ..Apdu::new(cla, ins, p1, p2)
        });
    }

    let lc = rest[0] as usize;
    if rest.len() == 1 + lc {
        // Case 3: Lc + data.
        return Ok(Apdu::with_data(cla, ins, p1, p2, rest[1..].to_vec()));
    }
    if rest.len() == 1 + lc + 1 {
        // Case 4: Lc + data + Le.
        let le_byte = rest[1 + lc];
        let le = if le_byte == 0 { 256 } else { le_byte as u32 };
        return Ok(Apdu {
            le: Some(le),
            ..Apdu::with_data(cla, ins, p1, p2, rest[1..1 + lc].to_vec())
        });
    }
    Err(ApduError::InvalidLength)
}

fn parse_extended(cla: u8, ins: u8, p1: u8, p2: u8, rest: &[u8]) -> Result<Apdu, ApduError> {
    if rest.len() < 2 {
        return Err(ApduError::InvalidExtendedFormat);
    }
    let first = ((rest[0] as u32) << 8) | rest[1] as u32;

    // Case 2E: only an extended Le, 0 meaning 65536.
    if rest.len() == 2 {
        let le = if first == 0 { 65536 } else { first };
        return Ok(Apdu {
            le: Some(le),
            ..Apdu::new(cla, ins, p1, p2)
        });
    }

    let lc = first as usize;
    if rest.len() == 2 + lc {
        // Case 3E.
        return Ok(Apdu::with_data(cla, ins, p1, p2, rest[2..].to_vec()));
    }
    if rest.len() == 2 + lc + 2 {
        // Case 4E.
        let le_word = ((rest[2 + lc] as u32) << 8) | rest[2 + lc + 1] as u32;
        let le = if le_word == 0 { 65536 } else { le_word };
        return Ok(Apdu {
            le: Some(le),
            ..Apdu::with_data(cla, ins, p1, p2, rest[2..2 + lc].to_vec())
        });
    }
    Err(ApduError::InvalidExtendedFormat)
}

/// ISO 7816-4 instruction bytes handled by the card engine.
pub mod ins {
    pub const ERASE_RECORD: u8 = 0x0C;
    pub const ERASE_BINARY: u8 = 0x0E;
    pub const ERASE_BINARY_ODD: u8 = 0x0F;
    pub const VERIFY: u8 = 0x20;
    pub const MANAGE_SECURITY_ENVIRONMENT: u8 = 0x22;
    pub const CHANGE_REFERENCE_DATA: u8 = 0x24;
    pub const PERFORM_SECURITY_OPERATION: u8 = 0x2A;
    pub const GENERATE_KEY_PAIR: u8 = 0x46;
    pub const EXTERNAL_AUTHENTICATE: u8 = 0x82;
    pub const GET_CHALLENGE: u8 = 0x84;
    pub const GENERAL_AUTHENTICATE: u8 = 0x86;
    pub const INTERNAL_AUTHENTICATE: u8 = 0x88;
    pub const SEARCH_BINARY: u8 = 0xA0;
    pub const SEARCH_BINARY_ODD: u8 = 0xA1;
    pub const SELECT_FILE: u8 = 0xA4;
    pub const READ_BINARY: u8 = 0xB0;
    pub const READ_BINARY_ODD: u8 = 0xB1;
    pub const READ_RECORD: u8 = 0xB2;
    pub const READ_RECORD_ODD: u8 = 0xB3;
    pub const GET_RESPONSE: u8 = 0xC0;
    pub const GET_DATA: u8 = 0xCA;
    pub const GET_DATA_ODD: u8 = 0xCB;
    pub const WRITE_BINARY: u8 = 0xD0;
    pub const WRITE_BINARY_ODD: u8 = 0xD1;
    pub const WRITE_RECORD: u8 = 0xD2;
    pub const UPDATE_BINARY: u8 = 0xD6;
    pub const UPDATE_BINARY_ODD: u8 = 0xD7;
    pub const PUT_DATA: u8 = 0xDA;
    pub const PUT_DATA_ODD: u8 = 0xDB;
    pub const UPDATE_RECORD: u8 = 0xDC;
    pub const UPDATE_RECORD_ODD: u8 = 0xDD;
    pub const CREATE_FILE: u8 = 0xE0;
    pub const APPEND_RECORD: u8 = 0xE2;
    pub const DELETE_FILE: u8 = 0xE4;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case1() {
        let apdu = parse_apdu(&[0x00, 0xA4, 0x00, 0x00]).unwrap();
        assert_eq!(apdu.ins, 0xA4);
        assert!(apdu.data.is_empty());
        assert!(apdu.le.is_none());
    }

    #[test]
    fn test_case2_le_zero_is_256() {
        let apdu = parse_apdu(&[0x00, 0xB0, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(apdu.le, Some(256));
    }

    #[test]
    fn test_case3() {
        let apdu = parse_apdu(&[0x00, 0x20, 0x00, 0x00, 0x04, 0x31, 0x32, 0x33, 0x34]).unwrap();
        assert_eq!(apdu.data, b"1234");
        assert!(apdu.le.is_none());
    }

    #[test]
    fn test_case4() {
        let apdu =
            parse_apdu(&[0x00, 0xA4, 0x04, 0x00, 0x02, 0x3F, 0x00, 0x10]).unwrap();
        assert_eq!(apdu.data, vec![0x3F, 0x00]);
        assert_eq!(apdu.le, Some(0x10));
    }

    #[test]
    fn test_case4_extended() {
        let mut raw = vec![0x00, 0xD6, 0x00, 0x00, 0x00, 0x01, 0x04];
        raw.extend_from_slice(&[0xAA; 0x104]);
        raw.extend_from_slice(&[0x00, 0x00]);
        let apdu = parse_apdu(&raw).unwrap();
        assert_eq!(apdu.data.len(), 0x104);
        assert_eq!(apdu.le, Some(65536));
    }

    #[test]
    fn test_too_short() {
        assert_eq!(parse_apdu(&[0x00, 0xA4]), Err(ApduError::TooShort(2)));
    }

    #[test]
    fn test_class_first_industry_sm_modes() {
        assert_eq!(ClassByte::decode(0x00).sm, SmMode::None);
        assert_eq!(ClassByte::decode(0x04).sm, SmMode::Proprietary);
        assert_eq!(ClassByte::decode(0x08).sm, SmMode::Standard);
        assert_eq!(ClassByte::decode(0x0C).sm, SmMode::StandardHeaderAuth);
        assert!(ClassByte::decode(0x0C).sm.authenticates_header());
    }

    #[test]
    fn test_class_first_industry_channel_and_chaining() {
        let cls = ClassByte::decode(0x13);
        assert_eq!(cls.channel, 3);
        assert!(cls.chaining);
    }

    #[test]
    fn test_class_further_industry() {
        // 0110 0101: further industry, SM set, channel 4 + 5.
        let cls = ClassByte::decode(0x65);
        assert_eq!(cls.sm, SmMode::Standard);
        assert_eq!(cls.channel, 9);
        // 0100 0000: no SM, channel 4.
        let cls = ClassByte::decode(0x40);
        assert_eq!(cls.sm, SmMode::None);
        assert_eq!(cls.channel, 4);
    }

    #[test]
    fn test_class_unrecognized_defaults_to_no_sm() {
        let cls = ClassByte::decode(0xFF);
        assert_eq!(cls.sm, SmMode::None);
        assert!(!cls.chaining);
    }
}
