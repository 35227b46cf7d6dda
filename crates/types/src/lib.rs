//! Core type definitions for the threshold random beacon.
//!
//! This crate provides the shared data structures used across the beacon
//! workspace: compressed curve points as they travel on the wire, party
//! identifiers, round seeds and the protocol envelope exchanged by peers.

use std::fmt;
use std::str::FromStr;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

pub mod encoding;

pub use encoding::EncodingError;

// =========================
// CRYPTOGRAPHIC PRIMITIVES
// =========================

/// Compressed G1 point on BLS12-381 (48 bytes). Signatures live in G1.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct G1Point(#[serde_as(as = "[_; 48]")] pub [u8; 48]);

impl G1Point {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, EncodingError> {
        encoding::decode_hex_array(s).map(Self)
    }
}

/// Compressed G2 point on BLS12-381 (96 bytes). Commitments and public keys live in G2.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct G2Point(#[serde_as(as = "[_; 96]")] pub [u8; 96]);

impl G2Point {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, EncodingError> {
        encoding::decode_hex_array(s).map(Self)
    }
}

// =========================
// PARTICIPANTS AND ROUNDS
// =========================

/// Epoch (magic block) number a DKG instance is bound to.
pub type EpochId = i64;

/// Consensus round number.
pub type Round = u64;

/// Participant identifier within one epoch.
///
/// PartyIDs are the 1-based position of the participant in the epoch's
/// ordered roster, so they are never zero and are usable directly as
/// polynomial evaluation points.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshSerialize,
    Serialize,
    Deserialize,
)]
#[serde(try_from = "u32", into = "u32")]
pub struct PartyId(u32);

impl PartyId {
    /// Returns `None` for zero, which is reserved for the shared secret.
    pub fn new(id: u32) -> Option<Self> {
        (id != 0).then_some(Self(id))
    }

    /// PartyID of the participant at `index` (0-based) in the roster.
    pub fn from_index(index: usize) -> Option<Self> {
        u32::try_from(index)
            .ok()
            .and_then(|i| i.checked_add(1))
            .map(Self)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// 0-based roster index.
    pub fn index(self) -> usize {
        self.0.saturating_sub(1) as usize
    }
}

impl BorshDeserialize for PartyId {
    fn deserialize_reader<R: std::io::Read>(reader: &mut R) -> std::io::Result<Self> {
        let id = u32::deserialize_reader(reader)?;
        Self::new(id).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "party id must be non-zero")
        })
    }
}

impl TryFrom<u32> for PartyId {
    type Error = EncodingError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| EncodingError::InvalidPartyId(value.to_string()))
    }
}

impl From<PartyId> for u32 {
    fn from(party: PartyId) -> Self {
        party.0
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PartyId {
    type Err = EncodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !encoding::is_canonical_decimal(s) {
            return Err(EncodingError::InvalidPartyId(s.to_string()));
        }
        let value: u32 = s
            .parse()
            .map_err(|_| EncodingError::InvalidPartyId(s.to_string()))?;
        Self::try_from(value)
    }
}

/// Pseudorandom output of a round, used to seed the next round's message.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct RandomSeed(pub i64);

impl fmt::Display for RandomSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Seed standing in for the (nonexistent) predecessor of round 1.
pub const GENESIS_RANDOM_SEED: RandomSeed = RandomSeed(839_695_260_482_366_273);

/// Seed the message of `round` is built from.
///
/// Round 1 (and the degenerate round 0) always use [`GENESIS_RANDOM_SEED`];
/// later rounds need the previous round's seed.
pub fn seed_for_round(round: Round, previous: Option<RandomSeed>) -> Option<RandomSeed> {
    if round <= 1 {
        Some(GENESIS_RANDOM_SEED)
    } else {
        previous
    }
}

/// Canonical message signed by every participant in `round`.
pub fn round_message(round: Round, previous_seed: RandomSeed) -> Vec<u8> {
    format!("round:{round}|seed:{previous_seed}").into_bytes()
}

// =========================
// WIRE ENVELOPE
// =========================

/// Message exchanged between peers.
///
/// Payload strings keep their canonical text form: secret shares are decimal
/// scalars and signature shares are hex-encoded compressed G1 points.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub enum ProtocolMessage {
    /// DKG share computed by `sender` for the recipient.
    SecretShare {
        epoch: EpochId,
        sender: PartyId,
        share: String,
    },
    /// Receipt for a `SecretShare`, stops retransmission towards `sender`.
    ShareAck { epoch: EpochId, sender: PartyId },
    /// Partial signature over the round message.
    SignatureShare {
        epoch: EpochId,
        round: Round,
        sender: PartyId,
        share: String,
    },
}

impl ProtocolMessage {
    pub fn sender(&self) -> PartyId {
        match self {
            Self::SecretShare { sender, .. }
            | Self::ShareAck { sender, .. }
            | Self::SignatureShare { sender, .. } => *sender,
        }
    }

    pub fn epoch(&self) -> EpochId {
        match self {
            Self::SecretShare { epoch, .. }
            | Self::ShareAck { epoch, .. }
            | Self::SignatureShare { epoch, .. } => *epoch,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodingError> {
        borsh::to_vec(self).map_err(|e| EncodingError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EncodingError> {
        borsh::from_slice(bytes).map_err(|e| EncodingError::Codec(e.to_string()))
    }
}

/// Compute SHA-256 hash
pub fn sha256(data: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    Sha256::digest(data).into()
}
