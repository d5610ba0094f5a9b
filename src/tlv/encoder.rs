//! TLV encoding
//!
//! Exact inverse of the decoder: tag byte count follows from the tag's
//! numeric value, lengths use the shortest definite form.

use super::SimpleTlv;

/// Encode a tag field from its packed representation.
pub fn encode_tag(tag: u32) -> Vec<u8> {
    if tag > 0xFF_FF_FF {
        vec![(tag >> 24) as u8, (tag >> 16) as u8, (tag >> 8) as u8, tag as u8]
    } else if tag > 0xFF_FF {
        vec![(tag >> 16) as u8, (tag >> 8) as u8, tag as u8]
    } else if tag > 0xFF {
        vec![(tag >> 8) as u8, tag as u8]
    } else {
        vec![tag as u8]
    }
}

/// Encode a definite-form length field.
pub fn encode_length(length: usize) -> Vec<u8> {
    if length < 0x80 {
        vec![length as u8]
    } else if length <= 0xFF {
        vec![0x81, length as u8]
    } else if length <= 0xFF_FF {
        vec![0x82, (length >> 8) as u8, length as u8]
    } else if length <= 0xFF_FF_FF {
        vec![0x83, (length >> 16) as u8, (length >> 8) as u8, length as u8]
    } else {
        vec![
            0x84,
            (length >> 24) as u8,
            (length >> 16) as u8,
            (length >> 8) as u8,
            length as u8,
        ]
    }
}

/// Encode a SIMPLE-TLV element: one-byte length below 0xFF, otherwise
/// the 0xFF marker with a two-byte big-endian length.
pub fn encode_simple(tlv: &SimpleTlv) -> Vec<u8> {
    let mut out = vec![tlv.tag];
    if tlv.value.len() < 0xFF {
        out.push(tlv.value.len() as u8);
    } else {
        out.push(0xFF);
        out.push((tlv.value.len() >> 8) as u8);
        out.push(tlv.value.len() as u8);
    }
    out.extend_from_slice(&tlv.value);
    out
}

/// Chainable builder for response templates.
///
/// # Example
/// ```ignore
/// let fci = TlvBuilder::new()
///     .push(0x83, &fid.to_be_bytes())
///     .push(0x8A, &[life_cycle])
///     .wrap(0x6F)
///     .build();
/// ```
#[derive(Debug, Default)]
pub struct TlvBuilder {
    data: Vec<u8>,
}

impl TlvBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one primitive element.
    pub fn push(mut self, tag: u32, value: &[u8]) -> Self {
        self.data.extend(encode_tag(tag));
        self.data.extend(encode_length(value.len()));
        self.data.extend_from_slice(value);
        self
    }

    /// Append one primitive element only when a value is present.
    pub fn push_opt(self, tag: u32, value: Option<&[u8]>) -> Self {
        match value {
            Some(value) => self.push(tag, value),
            None => self,
        }
    }

    /// Append pre-encoded bytes.
    pub fn push_raw(mut self, raw: &[u8]) -> Self {
        self.data.extend_from_slice(raw);
        self
    }

    /// Wrap everything built so far in a constructed element.
    pub fn wrap(self, tag: u32) -> Self {
        let mut data = encode_tag(tag);
        data.extend(encode_length(self.data.len()));
        data.extend(self.data);
        Self { data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn build(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::super::{decode, decode_simple, Tlv};
    use super::*;

    #[test]
    fn test_encode_tag_widths() {
        assert_eq!(encode_tag(0x4F), vec![0x4F]);
        assert_eq!(encode_tag(0x5F2D), vec![0x5F, 0x2D]);
        assert_eq!(encode_tag(0xDF8101), vec![0xDF, 0x81, 0x01]);
    }

    #[test]
    fn test_encode_length_forms() {
        assert_eq!(encode_length(0x7F), vec![0x7F]);
        assert_eq!(encode_length(0x80), vec![0x81, 0x80]);
        assert_eq!(encode_length(0x100), vec![0x82, 0x01, 0x00]);
    }

    #[test]
    fn test_ber_round_trip() {
        let cases = vec![
            Tlv::new(0x4F, vec![0xD2, 0x76]),
            Tlv::new(0x5F2D, b"de".to_vec()),
            Tlv::new(0xDF8101, vec![0x00; 130]),
            Tlv::constructed(0x7C, vec![Tlv::new(0x81, vec![1, 2, 3])]),
        ];
        for tlv in cases {
            let decoded = decode(&tlv.to_bytes()).unwrap();
            assert_eq!(decoded, vec![tlv]);
        }
    }

    #[test]
    fn test_simple_round_trip() {
        for len in [0usize, 1, 0xFE, 0xFF, 0x300] {
            let tlv = SimpleTlv {
                tag: 0x10,
                value: vec![0x5A; len],
            };
            let decoded = decode_simple(&encode_simple(&tlv)).unwrap();
            assert_eq!(decoded, vec![tlv]);
        }
    }

    #[test]
    fn test_builder_wrap() {
        let bytes = TlvBuilder::new()
            .push(0x83, &[0x3F, 0x00])
            .push(0x8A, &[0x05])
            .wrap(0x62)
            .build();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded[0].tag, 0x62);
        assert_eq!(decoded[0].children.len(), 2);
    }
}
