//! BLS12-381 helpers: hashing to the curve, point and scalar codecs.
//!
//! Signatures live in G1 and public keys/commitments in G2, so a signature
//! σ = sk · H(m) verifies as e(σ, g2) = e(H(m), sk · g2).

use bls12_381::hash_to_curve::{ExpandMsgXmd, HashToCurve};
use bls12_381::{pairing, G1Affine, G1Projective, G2Affine, G2Projective, Scalar};
use group::Curve;
use rand::{CryptoRng, RngCore};
use sha2_09::Sha256;

use beacon_types::encoding::{decimal_to_le_bytes, decode_hex_array, le_bytes_to_decimal};
use beacon_types::{G1Point, G2Point, PartyId};

use crate::error::CryptoError;

/// Domain separation tag for round-message signatures (RFC 9380 suite name).
pub const SIGNATURE_DST: &[u8] = b"BLS_SIG_BLS12381G1_XMD:SHA-256_SSWU_RO_NUL_";

/// Hash arbitrary data to a G1 point using hash-to-curve.
///
/// Uses the expand_message_xmd method with SHA-256 as specified in RFC 9380.
pub fn hash_to_g1(data: &[u8]) -> G1Affine {
    <G1Projective as HashToCurve<ExpandMsgXmd<Sha256>>>::hash_to_curve(data, SIGNATURE_DST)
        .to_affine()
}

/// Plain BLS verification: e(σ, g2) == e(H(m), pk).
pub fn verify_signature(signature: &G1Affine, message: &[u8], public_key: &G2Affine) -> bool {
    let lhs = pairing(signature, &G2Affine::generator());
    let rhs = pairing(&hash_to_g1(message), public_key);
    lhs == rhs
}

/// Evaluation point of a participant in every polynomial of the epoch.
pub fn party_scalar(party: PartyId) -> Scalar {
    Scalar::from(u64::from(party.get()))
}

/// Generate a random scalar.
pub fn random_scalar<R: RngCore + CryptoRng>(rng: &mut R) -> Scalar {
    let mut bytes = [0u8; 64];
    rng.fill_bytes(&mut bytes);
    Scalar::from_bytes_wide(&bytes)
}

/// Public commitment g2^s for a scalar.
pub fn commit(scalar: &Scalar) -> G2Projective {
    G2Projective::generator() * scalar
}

// =========================
// SCALAR CODECS
// =========================

/// Decimal wire form of a scalar.
pub fn scalar_to_decimal(scalar: &Scalar) -> String {
    le_bytes_to_decimal(&scalar.to_bytes())
}

/// Parse a decimal scalar; values at or above the field order are rejected.
pub fn scalar_from_decimal(s: &str) -> Result<Scalar, CryptoError> {
    let bytes = decimal_to_le_bytes(s)?;
    scalar_from_bytes(&bytes)
}

/// Hex storage form of a scalar (32 bytes, little-endian).
pub fn scalar_to_hex(scalar: &Scalar) -> String {
    hex::encode(scalar.to_bytes())
}

pub fn scalar_from_hex(s: &str) -> Result<Scalar, CryptoError> {
    let bytes: [u8; 32] = decode_hex_array(s)?;
    scalar_from_bytes(&bytes)
}

fn scalar_from_bytes(bytes: &[u8; 32]) -> Result<Scalar, CryptoError> {
    Option::<Scalar>::from(Scalar::from_bytes(bytes)).ok_or(CryptoError::InvalidScalar)
}

// =========================
// POINT CODECS
// =========================

/// Compress a G1 point to bytes.
pub fn compress_g1(point: &G1Affine) -> G1Point {
    G1Point(point.to_compressed())
}

/// Decompress a G1 point from bytes.
pub fn decompress_g1(point: &G1Point) -> Result<G1Affine, CryptoError> {
    Option::<G1Affine>::from(G1Affine::from_compressed(&point.0)).ok_or(CryptoError::InvalidG1Point)
}

/// Compress a G2 point to bytes.
pub fn compress_g2(point: &G2Affine) -> G2Point {
    G2Point(point.to_compressed())
}

/// Decompress a G2 point from bytes.
pub fn decompress_g2(point: &G2Point) -> Result<G2Affine, CryptoError> {
    Option::<G2Affine>::from(G2Affine::from_compressed(&point.0)).ok_or(CryptoError::InvalidG2Point)
}

/// Hex wire form of a signature.
pub fn signature_to_hex(signature: &G1Affine) -> String {
    compress_g1(signature).to_hex()
}

/// Parse a hex signature into a curve point.
pub fn signature_from_hex(s: &str) -> Result<G1Affine, CryptoError> {
    let point = G1Point::from_hex(s)?;
    decompress_g1(&point)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_hash_to_g1() {
        let point1 = hash_to_g1(b"test identity 1");
        let point2 = hash_to_g1(b"test identity 2");
        let point3 = hash_to_g1(b"test identity 1");

        assert_ne!(point1, point2);
        assert_eq!(point1, point3);
    }

    #[test]
    fn test_hash_to_g1_lands_in_prime_order_subgroup() {
        let long = [0xffu8; 300];
        let messages: [&[u8]; 3] = [b"", b"round:1|seed:839695260482366273", &long];
        for message in messages {
            let point = hash_to_g1(message);
            assert!(!bool::from(point.is_identity()));
            assert!(bool::from(point.is_on_curve()));
            assert!(bool::from(point.is_torsion_free()));
        }
    }

    #[test]
    fn test_sign_and_verify() {
        let sk = random_scalar(&mut OsRng);
        let pk = commit(&sk).to_affine();
        let message = b"round:1|seed:7";

        let signature = (G1Projective::from(hash_to_g1(message)) * sk).to_affine();

        assert!(verify_signature(&signature, message, &pk));
        assert!(!verify_signature(&signature, b"round:2|seed:7", &pk));
    }

    #[test]
    fn test_scalar_decimal_rejects_out_of_field() {
        // 2^255 is above the BLS12-381 scalar field order.
        let mut bytes = [0u8; 32];
        bytes[31] = 0x80;
        let decimal = le_bytes_to_decimal(&bytes);
        assert_eq!(scalar_from_decimal(&decimal), Err(CryptoError::InvalidScalar));
    }

    #[test]
    fn test_signature_hex_rejects_garbage() {
        assert!(signature_from_hex("not hex").is_err());
        assert!(signature_from_hex(&"00".repeat(48)).is_err());
        assert!(signature_from_hex(&"ab".repeat(47)).is_err());
    }

    #[test]
    fn test_party_scalar() {
        let party = PartyId::new(3).unwrap();
        assert_eq!(party_scalar(party), Scalar::from(3u64));
    }
}
