//! Error types for command processing
//!
//! Protocol failures and implementation bugs are deliberately kept apart.
//! Everything a terminal can trigger over the wire is a [`SwError`]
//! carrying an ISO 7816-4 status word; the dispatcher converts it into a
//! response APDU and keeps the session alive. [`StructureError`] covers
//! contract violations when building card contents programmatically and
//! is allowed to propagate as a bug.

use std::borrow::Cow;
use thiserror::Error;

use crate::apdu::SW;

/// Result type used throughout command processing.
pub type CardResult<T> = Result<T, SwError>;

/// A protocol-level failure with its ISO 7816-4 status word.
///
/// This is the sole error propagation mechanism through command handling.
/// # Example
/// ```ignore
/// fn read(file: &TransparentFile, offset: usize) -> CardResult<&[u8]> {
///     if offset > file.len() {
///         return Err(SwError::offset_out_of_file());
///     }
///     ...
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (SW 0x{sw:04X})")]
pub struct SwError {
    /// The status word reported to the terminal.
    pub sw: u16,
    /// Human-readable description, for logs only.
    pub message: Cow<'static, str>,
}

impl SwError {
    /// Create an error from a bare status word, using the canonical
    /// description from the status-word name table.
    pub fn new(sw: u16) -> Self {
        Self {
            sw,
            message: Cow::Borrowed(SW::describe(sw)),
        }
    }

    /// Create an error with a custom log message.
    pub fn with_message(sw: u16, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            sw,
            message: message.into(),
        }
    }

    pub fn file_not_found() -> Self {
        Self::new(SW::FILE_NOT_FOUND)
    }

    pub fn record_not_found() -> Self {
        Self::new(SW::RECORD_NOT_FOUND)
    }

    pub fn data_not_found() -> Self {
        Self::new(SW::REFERENCED_DATA_NOT_FOUND)
    }

    pub fn file_exists() -> Self {
        Self::new(SW::FILE_ALREADY_EXISTS)
    }

    /// Offset past the end of a transparent file's buffer.
    pub fn offset_out_of_file() -> Self {
        Self::with_message(SW::INCORRECT_P1_P2, "offset outside of file")
    }

    pub fn not_enough_memory() -> Self {
        Self::new(SW::NOT_ENOUGH_MEMORY)
    }

    pub fn incorrect_parameters() -> Self {
        Self::new(SW::INCORRECT_PARAMETERS)
    }

    pub fn incorrect_p1p2() -> Self {
        Self::new(SW::INCORRECT_P1_P2)
    }

    pub fn wrong_length() -> Self {
        Self::new(SW::WRONG_LENGTH)
    }

    pub fn instruction_not_supported() -> Self {
        Self::new(SW::INS_NOT_SUPPORTED)
    }

    pub fn security_status_not_satisfied() -> Self {
        Self::new(SW::SECURITY_STATUS_NOT_SATISFIED)
    }

    pub fn authentication_blocked() -> Self {
        Self::new(SW::AUTH_METHOD_BLOCKED)
    }

    pub fn reference_not_usable() -> Self {
        Self::new(SW::REFERENCE_DATA_NOT_USABLE)
    }

    pub fn conditions_not_satisfied() -> Self {
        Self::new(SW::CONDITIONS_NOT_SATISFIED)
    }

    pub fn sm_objects_missing() -> Self {
        Self::new(SW::EXPECTED_SM_DATA_OBJECTS_MISSING)
    }

    pub fn sm_objects_incorrect() -> Self {
        Self::new(SW::INCORRECT_SM_DATA_OBJECTS)
    }

    /// Wrong secret with retries left: 0x63Cx.
    pub fn warn_tries_left(tries: u8) -> Self {
        Self::with_message(SW::counter_warning(tries), "wrong secret")
    }

    pub fn wrong_data() -> Self {
        Self::new(SW::WRONG_DATA)
    }

    /// Generic warning used where a specific status would leak
    /// information to an attacker (key-establishment token checks).
    pub fn generic_warning() -> Self {
        Self::with_message(SW::WARNING_AUTH_FAILED, "authentication warning")
    }
}

/// Contract violation while constructing card contents.
///
/// Raised by file/record constructors for inputs no terminal command can
/// produce; reaching one of these from the dispatch path is a bug.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructureError {
    #[error("record identifier {0:#04x} outside 0x01..=0xFE")]
    BadRecordIdentifier(u8),

    #[error("short file identifier {0} outside 1..=30")]
    BadShortFid(u8),

    #[error("dedicated file name must be 1..=16 bytes, got {0}")]
    BadDfName(usize),

    #[error("record of {got} bytes in a fixed file of {fixed}-byte records")]
    RecordSizeMismatch { fixed: usize, got: usize },

    #[error("file {0:#06x} already carries a child with that identifier")]
    DuplicateFid(u16),
}
