//! Error types for cryptographic operations.

use beacon_types::EncodingError;
use thiserror::Error;

/// Errors that can occur during cryptographic operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("Invalid G1 point encoding")]
    InvalidG1Point,

    #[error("Invalid G2 point encoding")]
    InvalidG2Point,

    #[error("Invalid scalar encoding")]
    InvalidScalar,

    #[error("Malformed share: {0}")]
    MalformedShare(String),

    #[error("Verification vector is empty")]
    EmptyVerificationVector,

    #[error("Signature share from party {0} does not verify")]
    SignatureMismatch(u32),

    #[error("Group signature does not verify against the group public key")]
    GroupSignatureMismatch,

    #[error("Insufficient threshold shares: need {required}, got {got}")]
    InsufficientShares { required: usize, got: usize },

    #[error("Invalid threshold {0}")]
    InvalidThreshold(usize),

    #[error("Lagrange interpolation failed")]
    LagrangeInterpolationFailed,

    #[error(transparent)]
    Encoding(#[from] EncodingError),
}
