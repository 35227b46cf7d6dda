//! Canonical text encodings for wire and storage values.
//!
//! Scalars travel as decimal strings of their 256-bit integer value and are
//! stored as little-endian byte arrays. The conversions here are exact: every
//! canonical string decodes to one byte array and encodes back to the same
//! string, which is what lets duplicate deliveries be recognised by value.

use num_bigint::BigUint;
use thiserror::Error;

/// Errors raised while decoding wire or storage values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("Invalid decimal encoding: {0:?}")]
    InvalidDecimal(String),

    #[error("Decimal value does not fit in 256 bits")]
    DecimalOverflow,

    #[error("Invalid hex encoding: {0}")]
    InvalidHex(String),

    #[error("Invalid length: expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("Invalid party identifier: {0:?}")]
    InvalidPartyId(String),

    #[error("Message codec error: {0}")]
    Codec(String),
}

/// True for non-empty ASCII digit strings without redundant leading zeros.
pub fn is_canonical_decimal(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| b.is_ascii_digit())
        && (s == "0" || !s.starts_with('0'))
}

/// Render a 256-bit little-endian integer in decimal.
pub fn le_bytes_to_decimal(bytes: &[u8; 32]) -> String {
    BigUint::from_bytes_le(bytes).to_str_radix(10)
}

/// Parse a canonical decimal string into a 256-bit little-endian integer.
pub fn decimal_to_le_bytes(s: &str) -> Result<[u8; 32], EncodingError> {
    // `parse_bytes` tolerates `+` and `_`, so canonical form is checked first.
    if !is_canonical_decimal(s) {
        return Err(EncodingError::InvalidDecimal(s.to_string()));
    }
    let value = BigUint::parse_bytes(s.as_bytes(), 10)
        .ok_or_else(|| EncodingError::InvalidDecimal(s.to_string()))?;
    if value.bits() > 256 {
        return Err(EncodingError::DecimalOverflow);
    }

    let mut out = [0u8; 32];
    let le = value.to_bytes_le();
    out[..le.len()].copy_from_slice(&le);
    Ok(out)
}

/// Decode a hex string into a fixed-size array.
pub fn decode_hex_array<const N: usize>(s: &str) -> Result<[u8; N], EncodingError> {
    let bytes = hex::decode(s).map_err(|e| EncodingError::InvalidHex(e.to_string()))?;
    let got = bytes.len();
    bytes
        .try_into()
        .map_err(|_| EncodingError::InvalidLength { expected: N, got })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_values() {
        let mut one = [0u8; 32];
        one[0] = 1;
        assert_eq!(le_bytes_to_decimal(&[0u8; 32]), "0");
        assert_eq!(le_bytes_to_decimal(&one), "1");

        let mut value = [0u8; 32];
        value[0] = 0x39;
        value[1] = 0x30;
        assert_eq!(le_bytes_to_decimal(&value), "12345");
        assert_eq!(decimal_to_le_bytes("12345").unwrap(), value);
    }

    #[test]
    fn test_max_value() {
        let max = [0xffu8; 32];
        let decimal = le_bytes_to_decimal(&max);
        assert_eq!(
            decimal,
            "115792089237316195423570985008687907853269984665640564039457584007913129639935"
        );
        assert_eq!(decimal_to_le_bytes(&decimal).unwrap(), max);
    }

    #[test]
    fn test_overflow_rejected() {
        let too_big =
            "115792089237316195423570985008687907853269984665640564039457584007913129639936";
        assert_eq!(decimal_to_le_bytes(too_big), Err(EncodingError::DecimalOverflow));
    }

    #[test]
    fn test_non_canonical_rejected() {
        for bad in ["", "007", "-1", "+1", "12a", " 1", "1.0", "1_000"] {
            assert!(decimal_to_le_bytes(bad).is_err(), "{bad:?} must be rejected");
        }
    }

    #[test]
    fn test_hex_array_length() {
        assert!(decode_hex_array::<4>("deadbeef").is_ok());
        assert_eq!(
            decode_hex_array::<4>("dead"),
            Err(EncodingError::InvalidLength { expected: 4, got: 2 })
        );
        assert!(matches!(
            decode_hex_array::<2>("zz"),
            Err(EncodingError::InvalidHex(_))
        ));
    }
}
