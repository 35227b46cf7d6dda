//! Distributed Key Generation for the threshold BLS random beacon.
//!
//! Implements a (t, n) threshold key generation protocol using Feldman VSS:
//!
//! 1. Each participant generates a random polynomial of degree t-1
//! 2. Participants exchange one share per peer, evaluated at the peer's PartyID
//! 3. Shares are optionally verified against the sender's verification vector
//! 4. Once all n shares are in, each participant sums them into its group secret share
//! 5. The group verification vector is the element-wise sum of every participant's vector
//!
//! # Security
//!
//! - Aggregation requires a share from every registered participant, so no
//!   minority can choose the group key on its own
//! - Privacy holds against up to t-1 corrupt participants
//! - Uses Feldman commitments for verifiability

pub mod engine;
pub mod feldman;
pub mod party;
pub mod types;

pub use engine::{DkgEngine, DkgError, ShareOutcome};
pub use party::PartyRoster;
pub use types::{DkgConfig, GroupSecretShare, GroupVerificationVector, VerificationVector};
