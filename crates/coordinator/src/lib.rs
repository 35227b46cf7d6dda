//! Random Beacon Coordinator
//!
//! This crate drives the beacon protocol for one node:
//! 1. Exchanging DKG shares with every peer until the group secret share is aggregated
//! 2. Signing each round message and collecting peers' signature shares
//! 3. Recovering the group signature once the threshold is met
//! 4. Deriving the round's beacon and persisting the epoch's checkpoint
//!
//! The network is reached only through [`PeerNetwork`]; inbound payloads go
//! through [`MessageRouter`].

pub mod checkpoint;
pub mod config;
pub mod epoch;
pub mod error;
pub mod network;
pub mod round_signing;
pub mod router;
pub mod share_exchange;

pub use checkpoint::{CheckpointStore, EpochCheckpoint, FileCheckpointStore, MemoryCheckpointStore};
pub use config::ProtocolConfig;
pub use epoch::{EpochMetadata, PartyVvec};
pub use error::{CheckpointError, CoordinatorError};
pub use network::{InMemoryNetwork, Inbox, NetworkEndpoint, PeerNetwork, RecordingNetwork};
pub use round_signing::{
    RoundBeacon, RoundPhase, RoundSignatureCoordinator, SignatureShareOutcome, SignerIdentity,
};
pub use router::MessageRouter;
pub use share_exchange::{ExchangePhase, ShareExchangeCoordinator};
