//! Threshold BLS primitives for the random beacon.
//!
//! Builds the protocol-level operations on top of BLS12-381 pairings:
//!
//! 1. **Encoding**: scalars, signatures and commitments to and from their
//!    canonical text forms.
//! 2. **Signing**: each participant signs the round message with its share
//!    of the group key, σ_i = sk_i · H(m).
//! 3. **Verification**: a partial signature is checked against the public
//!    key share implied by the group verification vector at the signer's
//!    PartyID.
//! 4. **Recovery**: any t valid partial signatures interpolate to the group
//!    signature σ = Σ λ_i · σ_i, which is hashed into the round's beacon.

pub mod bls;
pub mod error;
pub mod threshold;

pub use error::CryptoError;
pub use threshold::{derive_beacon, recover_signature, RandomBeacon, ThresholdSigner};
