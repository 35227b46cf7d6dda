//! Error types for the protocol coordinators.

use beacon_crypto::CryptoError;
use beacon_dkg::DkgError;
use beacon_types::{EncodingError, EpochId, Round};
use thiserror::Error;

/// Errors surfaced by the share and round coordinators.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Dkg(#[from] DkgError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error("Epoch mismatch: expected {expected}, got {got}")]
    EpochMismatch { expected: EpochId, got: EpochId },

    #[error("Round mismatch: current round {current}, got {got}")]
    RoundMismatch { current: Round, got: Round },

    #[error("Unknown party {0}")]
    UnknownParty(u32),

    #[error("Message claims our own PartyID {0} as sender")]
    SelfAddressed(u32),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Cancelled")]
    Cancelled,

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Errors reading or writing epoch checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Checkpoint for epoch {expected} holds a share for epoch {got}")]
    EpochMismatch { expected: EpochId, got: EpochId },

    #[error("Corrupt checkpoint: {0}")]
    Corrupt(String),
}
