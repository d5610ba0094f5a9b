//! Elliptic-curve operations for PACE generic mapping
//!
//! PACE maps the standard P-256 generator to an ephemeral one,
//! G' = s·G + H, where s is the card nonce and H the Diffie-Hellman
//! point agreed during the mapping phase. All point math comes from
//! the p256 crate; this module fixes encodings and the mapping
//! sequence.

use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::elliptic_curve::Field;
use p256::elliptic_curve::PrimeField;
use p256::{AffinePoint, EncodedPoint, FieldBytes, ProjectivePoint, Scalar};
use rand::rngs::OsRng;
use thiserror::Error;

/// Uncompressed SEC1 point size for P-256.
pub const POINT_SIZE: usize = 65;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EcdhError {
    #[error("invalid SEC1 point encoding")]
    InvalidPoint,

    #[error("scalar out of range")]
    InvalidScalar,

    #[error("point at infinity")]
    Infinity,
}

/// An ephemeral key pair over an arbitrary generator.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret: Scalar,
    pub public: ProjectivePoint,
}

/// Generate a key pair over `generator`.
pub fn generate_keypair(generator: &ProjectivePoint) -> KeyPair {
    let secret = Scalar::random(&mut OsRng);
    KeyPair {
        secret,
        public: *generator * secret,
    }
}

/// Diffie-Hellman: secret · point.
pub fn shared_point(secret: &Scalar, point: &ProjectivePoint) -> Result<ProjectivePoint, EcdhError> {
    let shared = *point * secret;
    if shared == ProjectivePoint::IDENTITY {
        return Err(EcdhError::Infinity);
    }
    Ok(shared)
}

/// The PACE generic mapping: G' = s·G + H.
pub fn map_generator(nonce: &Scalar, h: &ProjectivePoint) -> ProjectivePoint {
    ProjectivePoint::GENERATOR * nonce + h
}

/// Interpret up to 32 big-endian bytes as a scalar.
pub fn scalar_from_bytes(bytes: &[u8]) -> Result<Scalar, EcdhError> {
    if bytes.len() > 32 {
        return Err(EcdhError::InvalidScalar);
    }
    let mut padded = [0u8; 32];
    padded[32 - bytes.len()..].copy_from_slice(bytes);
    let repr = FieldBytes::from(padded);
    Option::<Scalar>::from(Scalar::from_repr(repr)).ok_or(EcdhError::InvalidScalar)
}

/// Decode an uncompressed SEC1 point.
pub fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint, EcdhError> {
    let encoded = EncodedPoint::from_bytes(bytes).map_err(|_| EcdhError::InvalidPoint)?;
    let affine =
        Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
            .ok_or(EcdhError::InvalidPoint)?;
    Ok(ProjectivePoint::from(affine))
}

/// Encode a point uncompressed (0x04 || x || y).
pub fn encode_point(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(false).as_bytes().to_vec()
}

/// The x coordinate of a point, the shared-secret value fed to the KDF.
pub fn x_coordinate(point: &ProjectivePoint) -> Vec<u8> {
    let encoded = point.to_affine().to_encoded_point(false);
    encoded
        .x()
        .map(|x| x.to_vec())
        .unwrap_or_else(|| vec![0u8; 32])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dh_agreement() {
        let g = ProjectivePoint::GENERATOR;
        let a = generate_keypair(&g);
        let b = generate_keypair(&g);
        let k_a = shared_point(&a.secret, &b.public).unwrap();
        let k_b = shared_point(&b.secret, &a.public).unwrap();
        assert_eq!(x_coordinate(&k_a), x_coordinate(&k_b));
    }

    #[test]
    fn test_point_round_trip() {
        let pair = generate_keypair(&ProjectivePoint::GENERATOR);
        let bytes = encode_point(&pair.public);
        assert_eq!(bytes.len(), POINT_SIZE);
        assert_eq!(bytes[0], 0x04);
        assert_eq!(decode_point(&bytes).unwrap(), pair.public);
    }

    #[test]
    fn test_mapped_generator_agreement() {
        // Both sides derive the same mapped generator from the same
        // nonce and mapping shared point.
        let g = ProjectivePoint::GENERATOR;
        let card = generate_keypair(&g);
        let term = generate_keypair(&g);
        let h_card = shared_point(&card.secret, &term.public).unwrap();
        let h_term = shared_point(&term.secret, &card.public).unwrap();
        let s = scalar_from_bytes(&[0x11; 16]).unwrap();
        assert_eq!(map_generator(&s, &h_card), map_generator(&s, &h_term));
    }

    #[test]
    fn test_scalar_rejects_oversize() {
        assert_eq!(
            scalar_from_bytes(&[0u8; 33]),
            Err(EcdhError::InvalidScalar)
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_point(&[0x05; 65]).is_err());
    }
}
