//! TLV decoding
//!
//! BER-TLV with multi-byte tags per the ISO/IEC 8825 continuation rule
//! and definite short/long-form lengths, plus the SIMPLE-TLV coding
//! with its 0xFF extended-length marker. Filler bytes 0x00 and 0xFF
//! between elements are skipped in both codings.

use thiserror::Error;

use super::{SimpleTlv, Tlv};

/// Errors raised during TLV decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TlvError {
    #[error("unexpected end of data while parsing a tag")]
    TruncatedTag,

    #[error("unexpected end of data while parsing a length")]
    TruncatedLength,

    #[error("unexpected end of data while parsing a value")]
    TruncatedValue,

    #[error("tag of more than 4 bytes")]
    TagTooLong,

    #[error("indefinite or oversized length encoding")]
    InvalidLength,

    #[error("invalid SIMPLE-TLV tag {0:#04x}")]
    InvalidSimpleTag(u8),

    #[error("unexpected tag {0:#06x}")]
    UnexpectedTag(u32),
}

/// Decode a complete BER-TLV sequence; constructed values decode
/// recursively.
pub fn decode(data: &[u8]) -> Result<Vec<Tlv>, TlvError> {
    let mut out = Vec::new();
    let mut rest = data;
    loop {
        rest = skip_filler(rest);
        if rest.is_empty() {
            return Ok(out);
        }
        let (tlv, tail) = decode_single(rest)?;
        out.push(tlv);
        rest = tail;
    }
}

/// Decode one BER-TLV element, returning it and the remaining bytes.
pub fn decode_single(data: &[u8]) -> Result<(Tlv, &[u8]), TlvError> {
    let (tag, constructed, after_tag) = decode_tag(data)?;
    let (length, after_len) = decode_length(after_tag)?;
    if after_len.len() < length {
        return Err(TlvError::TruncatedValue);
    }
    let value = after_len[..length].to_vec();
    let children = if constructed && !value.is_empty() {
        decode(&value)?
    } else {
        Vec::new()
    };
    Ok((
        Tlv {
            tag,
            value,
            children,
        },
        &after_len[length..],
    ))
}

/// Decode a SIMPLE-TLV sequence: 1-byte tags, 1-byte length or 0xFF
/// marker followed by a 2-byte big-endian extended length.
pub fn decode_simple(data: &[u8]) -> Result<Vec<SimpleTlv>, TlvError> {
    let mut out = Vec::new();
    let mut rest = data;
    loop {
        rest = skip_filler(rest);
        if rest.is_empty() {
            return Ok(out);
        }
        let tag = rest[0];
        if tag == 0x00 || tag == 0xFF {
            // skip_filler leaves none of these in front.
            return Err(TlvError::InvalidSimpleTag(tag));
        }
        let (length, header) = match rest.get(1) {
            None => return Err(TlvError::TruncatedLength),
            Some(0xFF) => {
                if rest.len() < 4 {
                    return Err(TlvError::TruncatedLength);
                }
                (((rest[2] as usize) << 8) | rest[3] as usize, 4)
            }
            Some(&len) => (len as usize, 2),
        };
        if rest.len() < header + length {
            return Err(TlvError::TruncatedValue);
        }
        out.push(SimpleTlv {
            tag,
            value: rest[header..header + length].to_vec(),
        });
        rest = &rest[header + length..];
    }
}

fn skip_filler(mut data: &[u8]) -> &[u8] {
    while let Some((&first, rest)) = data.split_first() {
        if first != 0x00 && first != 0xFF {
            break;
        }
        data = rest;
    }
    data
}

/// Decode a BER tag field: returns the raw tag bytes packed into a u32,
/// the constructed flag, and the remaining input.
fn decode_tag(data: &[u8]) -> Result<(u32, bool, &[u8]), TlvError> {
    let first = *data.first().ok_or(TlvError::TruncatedTag)?;
    let constructed = first & 0x20 != 0;
    if first & 0x1F != 0x1F {
        return Ok((first as u32, constructed, &data[1..]));
    }
    // Continuation: subsequent bytes carry bit 8 while more follow.
    let mut tag = first as u32;
    let mut used = 1;
    loop {
        let byte = *data.get(used).ok_or(TlvError::TruncatedTag)?;
        if used == 4 {
            return Err(TlvError::TagTooLong);
        }
        tag = (tag << 8) | byte as u32;
        used += 1;
        if byte & 0x80 == 0 {
            return Ok((tag, constructed, &data[used..]));
        }
    }
}

/// Decode a BER length field: short form below 0x80, otherwise
/// 0x80|n with n following length bytes. Only definite form is valid.
fn decode_length(data: &[u8]) -> Result<(usize, &[u8]), TlvError> {
    let first = *data.first().ok_or(TlvError::TruncatedLength)?;
    if first & 0x80 == 0 {
        return Ok((first as usize, &data[1..]));
    }
    let count = (first & 0x7F) as usize;
    if count == 0 || count > 4 {
        return Err(TlvError::InvalidLength);
    }
    if data.len() < 1 + count {
        return Err(TlvError::TruncatedLength);
    }
    let mut length = 0usize;
    for &byte in &data[1..1 + count] {
        length = (length << 8) | byte as usize;
    }
    Ok((length, &data[1 + count..]))
}

/// Split a bare concatenation of tag fields (the 0x5C tag-list value).
pub(super) fn split_tag_field(mut data: &[u8]) -> Result<Vec<u32>, TlvError> {
    let mut out = Vec::new();
    while !data.is_empty() {
        let (tag, _, rest) = decode_tag(data)?;
        out.push(tag);
        data = rest;
    }
    Ok(out)
}

/// Split a concatenation of tag and length fields (the 0x5D
/// header-list value).
pub(super) fn split_header_field(mut data: &[u8]) -> Result<Vec<(u32, usize)>, TlvError> {
    let mut out = Vec::new();
    while !data.is_empty() {
        let (tag, _, rest) = decode_tag(data)?;
        let (length, rest) = decode_length(rest)?;
        out.push((tag, length));
        data = rest;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_byte_tag() {
        let tlvs = decode(&hex::decode("4F03112233").unwrap()).unwrap();
        assert_eq!(tlvs.len(), 1);
        assert_eq!(tlvs[0].tag, 0x4F);
        assert_eq!(tlvs[0].value, vec![0x11, 0x22, 0x33]);
    }

    #[test]
    fn test_two_byte_tag() {
        let tlvs = decode(&hex::decode("5F2D02656E").unwrap()).unwrap();
        assert_eq!(tlvs[0].tag, 0x5F2D);
        assert_eq!(tlvs[0].value, b"en");
    }

    #[test]
    fn test_three_byte_tag_continuation() {
        // 0xDF 0x81 0x01: low five bits set, second byte has the
        // continuation bit, third does not.
        let tlvs = decode(&[0xDF, 0x81, 0x01, 0x01, 0xAA]).unwrap();
        assert_eq!(tlvs[0].tag, 0xDF8101);
        assert_eq!(tlvs[0].value, vec![0xAA]);
    }

    #[test]
    fn test_long_form_length() {
        let mut data = vec![0xC0, 0x82, 0x01, 0x00];
        data.extend(vec![0x55; 256]);
        let tlvs = decode(&data).unwrap();
        assert_eq!(tlvs[0].value.len(), 256);
    }

    #[test]
    fn test_constructed_recurses() {
        let tlvs = decode(&hex::decode("7C06810411223344").unwrap()).unwrap();
        assert_eq!(tlvs[0].tag, 0x7C);
        assert_eq!(tlvs[0].children.len(), 1);
        assert_eq!(tlvs[0].children[0].tag, 0x81);
        assert_eq!(tlvs[0].children[0].value.len(), 4);
    }

    #[test]
    fn test_filler_bytes_skipped() {
        let tlvs = decode(&hex::decode("00FF4F0101FF00").unwrap()).unwrap();
        assert_eq!(tlvs.len(), 1);
        assert_eq!(tlvs[0].tag, 0x4F);
    }

    #[test]
    fn test_truncated_value_is_an_error() {
        assert_eq!(decode(&[0x4F, 0x05, 0x01]), Err(TlvError::TruncatedValue));
    }

    #[test]
    fn test_indefinite_length_rejected() {
        assert_eq!(decode(&[0x30, 0x80, 0x01]), Err(TlvError::InvalidLength));
    }

    #[test]
    fn test_simple_tlv() {
        let tlvs = decode_simple(&[0x01, 0x03, 0xAA, 0xBB, 0xCC]).unwrap();
        assert_eq!(tlvs[0].tag, 0x01);
        assert_eq!(tlvs[0].value, vec![0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_simple_tlv_extended_length() {
        let mut data = vec![0x02, 0xFF, 0x01, 0x04];
        data.extend(vec![0x77; 0x104]);
        let tlvs = decode_simple(&data).unwrap();
        assert_eq!(tlvs[0].value.len(), 0x104);
    }

    #[test]
    fn test_simple_tlv_skips_leading_filler() {
        let tlvs = decode_simple(&[0x00, 0x05, 0x01, 0x42]).unwrap();
        assert_eq!(tlvs.len(), 1);
        assert_eq!(tlvs[0].tag, 0x05);
        assert_eq!(tlvs[0].value, vec![0x42]);
    }
}
