//! Response APDUs
//!
//! A response is a body plus a two-byte status word. Truncation for
//! response chaining happens in the dispatcher, not here.

use super::status::SW;
use crate::error::SwError;

/// A response APDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Response body, without the trailing status word.
    pub data: Vec<u8>,
    /// Combined status word.
    pub sw: u16,
}

impl Response {
    pub fn new(data: Vec<u8>, sw: u16) -> Self {
        Self { data, sw }
    }

    /// Body with status 0x9000.
    pub fn success(data: Vec<u8>) -> Self {
        Self::new(data, SW::SUCCESS)
    }

    /// Empty body with status 0x9000.
    pub fn ok() -> Self {
        Self::success(Vec::new())
    }

    /// Empty body with the given error status.
    pub fn error(sw: u16) -> Self {
        Self::new(Vec::new(), sw)
    }

    /// Partial body with 0x61XX signalling `remaining` buffered bytes.
    pub fn more_data(data: Vec<u8>, remaining: u8) -> Self {
        Self::new(data, SW::bytes_remaining(remaining))
    }

    pub fn is_okay(&self) -> bool {
        SW::is_success(self.sw)
    }

    pub fn sw1(&self) -> u8 {
        (self.sw >> 8) as u8
    }

    pub fn sw2(&self) -> u8 {
        self.sw as u8
    }

    /// Serialize for the wire: body followed by SW1 SW2.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 2);
        out.extend_from_slice(&self.data);
        out.push(self.sw1());
        out.push(self.sw2());
        out
    }
}

impl From<SwError> for Response {
    /// A protocol failure renders as an empty body with its status word.
    fn from(err: SwError) -> Self {
        Self::error(err.sw)
    }
}
