//! ISO 7816-4 status words
//!
//! Constants, helpers for the parameterized families (0x61XX, 0x63Cx),
//! and a process-wide name table used for log messages.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Status word constants.
pub struct SW;

impl SW {
    /// Normal processing.
    pub const SUCCESS: u16 = 0x9000;

    // Warnings
    pub const WARNING_NO_CHANGE: u16 = 0x6200;
    pub const WARNING_EOF: u16 = 0x6282;
    pub const WARNING_AUTH_FAILED: u16 = 0x6300;

    // Checking errors
    pub const WRONG_LENGTH: u16 = 0x6700;

    pub const SECURE_MESSAGING_NOT_SUPPORTED: u16 = 0x6882;

    pub const COMMAND_INCOMPATIBLE: u16 = 0x6981;
    pub const SECURITY_STATUS_NOT_SATISFIED: u16 = 0x6982;
    pub const AUTH_METHOD_BLOCKED: u16 = 0x6983;
    pub const REFERENCE_DATA_NOT_USABLE: u16 = 0x6984;
    pub const CONDITIONS_NOT_SATISFIED: u16 = 0x6985;
    pub const COMMAND_NOT_ALLOWED_NO_EF: u16 = 0x6986;
    pub const EXPECTED_SM_DATA_OBJECTS_MISSING: u16 = 0x6987;
    pub const INCORRECT_SM_DATA_OBJECTS: u16 = 0x6988;

    pub const WRONG_DATA: u16 = 0x6A80;
    pub const FUNCTION_NOT_SUPPORTED: u16 = 0x6A81;
    pub const FILE_NOT_FOUND: u16 = 0x6A82;
    pub const RECORD_NOT_FOUND: u16 = 0x6A83;
    pub const NOT_ENOUGH_MEMORY: u16 = 0x6A84;
    pub const INCORRECT_P1_P2: u16 = 0x6A86;
    pub const INCORRECT_PARAMETERS: u16 = 0x6A87;
    pub const REFERENCED_DATA_NOT_FOUND: u16 = 0x6A88;
    pub const FILE_ALREADY_EXISTS: u16 = 0x6A89;

    pub const WRONG_P1_P2: u16 = 0x6B00;

    pub const INS_NOT_SUPPORTED: u16 = 0x6D00;
    pub const CLA_NOT_SUPPORTED: u16 = 0x6E00;
    pub const UNKNOWN_ERROR: u16 = 0x6F00;

    /// Normal processing with `remaining` bytes left for GET RESPONSE.
    #[inline]
    pub fn bytes_remaining(remaining: u8) -> u16 {
        0x6100 | (remaining as u16)
    }

    /// Wrong secret, `retries` attempts left (0x63Cx).
    #[inline]
    pub fn counter_warning(retries: u8) -> u16 {
        0x63C0 | ((retries & 0x0F) as u16)
    }

    /// True for 0x9000 and the 0x61XX family.
    #[inline]
    pub fn is_success(sw: u16) -> bool {
        sw == Self::SUCCESS || Self::is_more_data(sw)
    }

    /// True for the 0x61XX response-chaining family.
    #[inline]
    pub fn is_more_data(sw: u16) -> bool {
        (sw & 0xFF00) == 0x6100
    }

    /// Canonical description of a status word, for log output.
    pub fn describe(sw: u16) -> &'static str {
        if Self::is_more_data(sw) {
            return "normal, more data available";
        }
        if (sw & 0xFFF0) == 0x63C0 {
            return "wrong secret, tries remaining in low nibble";
        }
        NAMES.get(&sw).copied().unwrap_or("unknown status word")
    }
}

/// Immutable status-word name table, initialized once and then only read.
static NAMES: Lazy<HashMap<u16, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (SW::SUCCESS, "normal processing"),
        (SW::WARNING_NO_CHANGE, "warning, state unchanged"),
        (SW::WARNING_EOF, "end of file reached before reading Le bytes"),
        (SW::WARNING_AUTH_FAILED, "authentication failed"),
        (SW::WRONG_LENGTH, "wrong length"),
        (SW::SECURE_MESSAGING_NOT_SUPPORTED, "secure messaging not supported"),
        (SW::COMMAND_INCOMPATIBLE, "command incompatible with file structure"),
        (SW::SECURITY_STATUS_NOT_SATISFIED, "security status not satisfied"),
        (SW::AUTH_METHOD_BLOCKED, "authentication method blocked"),
        (SW::REFERENCE_DATA_NOT_USABLE, "reference data not usable"),
        (SW::CONDITIONS_NOT_SATISFIED, "conditions of use not satisfied"),
        (SW::COMMAND_NOT_ALLOWED_NO_EF, "command not allowed, no current EF"),
        (SW::EXPECTED_SM_DATA_OBJECTS_MISSING, "expected secure messaging objects missing"),
        (SW::INCORRECT_SM_DATA_OBJECTS, "secure messaging objects incorrect"),
        (SW::WRONG_DATA, "incorrect data field"),
        (SW::FUNCTION_NOT_SUPPORTED, "function not supported"),
        (SW::FILE_NOT_FOUND, "file not found"),
        (SW::RECORD_NOT_FOUND, "record not found"),
        (SW::NOT_ENOUGH_MEMORY, "not enough memory space in the file"),
        (SW::INCORRECT_P1_P2, "incorrect parameters P1-P2"),
        (SW::INCORRECT_PARAMETERS, "data field inconsistent with P1-P2"),
        (SW::REFERENCED_DATA_NOT_FOUND, "referenced data not found"),
        (SW::FILE_ALREADY_EXISTS, "file already exists"),
        (SW::WRONG_P1_P2, "wrong parameters P1-P2"),
        (SW::INS_NOT_SUPPORTED, "instruction not supported"),
        (SW::CLA_NOT_SUPPORTED, "class not supported"),
        (SW::UNKNOWN_ERROR, "no precise diagnosis"),
    ])
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_remaining() {
        assert_eq!(SW::bytes_remaining(0), 0x6100);
        assert_eq!(SW::bytes_remaining(255), 0x61FF);
    }

    #[test]
    fn test_counter_warning() {
        assert_eq!(SW::counter_warning(3), 0x63C3);
        assert_eq!(SW::counter_warning(0), 0x63C0);
    }

    #[test]
    fn test_is_success() {
        assert!(SW::is_success(0x9000));
        assert!(SW::is_success(0x6142));
        assert!(!SW::is_success(0x6A82));
    }

    #[test]
    fn test_describe() {
        assert_eq!(SW::describe(0x6A82), "file not found");
        assert_eq!(SW::describe(0x63C1), "wrong secret, tries remaining in low nibble");
        assert_eq!(SW::describe(0x6177), "normal, more data available");
        assert_eq!(SW::describe(0x1234), "unknown status word");
    }
}
