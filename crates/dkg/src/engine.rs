//! Per-epoch DKG engine.

use std::collections::BTreeMap;

use bls12_381::{G2Projective, Scalar};
use ff::Field;
use rand::{CryptoRng, RngCore};
use thiserror::Error;
use tracing::{debug, info, warn};

use beacon_crypto::bls::scalar_from_decimal;
use beacon_crypto::CryptoError;
use beacon_types::{EpochId, PartyId};

use crate::feldman::{
    combine_commitments, generate_commitments, generate_polynomial, share_for, verify_share,
};
use crate::types::{DkgConfig, GroupSecretShare, GroupVerificationVector, VerificationVector};

/// Errors during DKG.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DkgError {
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Malformed share from party {sender}: {reason}")]
    MalformedShare { sender: u32, reason: String },

    #[error("Incomplete shares: have {have}, need {need}")]
    IncompleteShares { have: usize, need: usize },

    #[error("Invalid DKG configuration: {0}")]
    InvalidConfig(String),

    #[error("Expected {expected} verification vectors, got {got}")]
    VerificationVectorCount { expected: usize, got: usize },

    #[error("Verification vector has {got} commitments, expected {expected}")]
    VerificationVectorLength { expected: usize, got: usize },

    #[error("Share from party {0} does not match its verification vector")]
    ShareVerificationFailed(u32),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Result of delivering a share to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareOutcome {
    Accepted,
    /// The sender already delivered a share; state is unchanged.
    Duplicate,
}

/// One participant's view of a DKG epoch.
pub struct DkgEngine {
    config: DkgConfig,
    me: PartyId,
    /// Our secret polynomial coefficients
    polynomial: Vec<Scalar>,
    /// Shares we computed for each recipient
    shares_for_others: BTreeMap<PartyId, Scalar>,
    /// Shares received for us, one per sender
    received_shares: BTreeMap<PartyId, Scalar>,
    /// Verification vectors learned out of band
    peer_vvecs: BTreeMap<PartyId, Vec<G2Projective>>,
    group_share: Option<GroupSecretShare>,
}

impl DkgEngine {
    /// Sample this participant's polynomial of degree t-1.
    pub fn initialize<R: RngCore + CryptoRng>(
        config: DkgConfig,
        me: PartyId,
        rng: &mut R,
    ) -> Result<Self, DkgError> {
        if config.threshold == 0 || config.threshold > config.n {
            return Err(DkgError::InvalidConfig(format!(
                "threshold {} must be within 1..={}",
                config.threshold, config.n
            )));
        }
        check_party(&config, me)?;

        let polynomial = generate_polynomial(config.threshold as usize, rng);
        info!(
            party = me.get(),
            epoch = config.epoch,
            n = config.n,
            threshold = config.threshold,
            "Initialized DKG polynomial"
        );

        Ok(Self {
            config,
            me,
            polynomial,
            shares_for_others: BTreeMap::new(),
            received_shares: BTreeMap::new(),
            peer_vvecs: BTreeMap::new(),
            group_share: None,
        })
    }

    pub fn config(&self) -> &DkgConfig {
        &self.config
    }

    pub fn epoch(&self) -> EpochId {
        self.config.epoch
    }

    pub fn party(&self) -> PartyId {
        self.me
    }

    /// Our polynomial evaluated at `target`. Repeated calls return the same share.
    pub fn share_for(&mut self, target: PartyId) -> Result<Scalar, DkgError> {
        check_party(&self.config, target)?;
        let polynomial = &self.polynomial;
        Ok(*self
            .shares_for_others
            .entry(target)
            .or_insert_with(|| share_for(polynomial, target)))
    }

    /// Shares for every participant, ourselves included, in PartyID order.
    pub fn compute_all_shares(&mut self) -> Result<Vec<(PartyId, Scalar)>, DkgError> {
        let mut shares = Vec::with_capacity(self.config.n as usize);
        for party in (0..self.config.n as usize).filter_map(PartyId::from_index) {
            shares.push((party, self.share_for(party)?));
        }
        Ok(shares)
    }

    /// Record a peer's verification vector so its shares are checked on arrival.
    pub fn register_peer_vvec(
        &mut self,
        sender: PartyId,
        vvec: &VerificationVector,
    ) -> Result<(), DkgError> {
        check_party(&self.config, sender)?;
        if vvec.len() != self.config.threshold as usize {
            return Err(DkgError::VerificationVectorLength {
                expected: self.config.threshold as usize,
                got: vvec.len(),
            });
        }
        self.peer_vvecs.insert(sender, vvec.to_points()?);
        Ok(())
    }

    /// Store a share received from `sender`.
    ///
    /// A second delivery from the same sender is a no-op regardless of its
    /// value. Rejected shares are logged and never stored.
    pub fn accept_share(
        &mut self,
        sender: PartyId,
        share: Scalar,
    ) -> Result<ShareOutcome, DkgError> {
        let result = self.try_accept(sender, share);
        match &result {
            Ok(ShareOutcome::Accepted) => debug!(
                party = self.me.get(),
                sender = sender.get(),
                received = self.received_shares.len(),
                "Accepted DKG share"
            ),
            Ok(ShareOutcome::Duplicate) => debug!(
                party = self.me.get(),
                sender = sender.get(),
                "Ignoring duplicate DKG share"
            ),
            Err(e) => warn!(
                party = self.me.get(),
                sender = sender.get(),
                error = %e,
                "Rejected DKG share"
            ),
        }
        result
    }

    /// Decode a decimal share from the wire and accept it.
    pub fn accept_encoded_share(
        &mut self,
        sender: PartyId,
        encoded: &str,
    ) -> Result<ShareOutcome, DkgError> {
        match scalar_from_decimal(encoded) {
            Ok(share) => self.accept_share(sender, share),
            Err(e) => {
                warn!(
                    party = self.me.get(),
                    sender = sender.get(),
                    error = %e,
                    "Dropping malformed DKG share"
                );
                Err(DkgError::MalformedShare {
                    sender: sender.get(),
                    reason: e.to_string(),
                })
            }
        }
    }

    fn try_accept(&mut self, sender: PartyId, share: Scalar) -> Result<ShareOutcome, DkgError> {
        check_party(&self.config, sender)?;
        if self.received_shares.contains_key(&sender) {
            return Ok(ShareOutcome::Duplicate);
        }
        if let Some(commitments) = self.peer_vvecs.get(&sender) {
            if !verify_share(&share, self.me, commitments) {
                return Err(DkgError::ShareVerificationFailed(sender.get()));
            }
        }
        self.received_shares.insert(sender, share);
        Ok(ShareOutcome::Accepted)
    }

    pub fn has_share_from(&self, sender: PartyId) -> bool {
        self.received_shares.contains_key(&sender)
    }

    pub fn received_count(&self) -> usize {
        self.received_shares.len()
    }

    /// True once every registered participant has delivered a share.
    pub fn is_complete(&self) -> bool {
        self.received_shares.len() == self.config.n as usize
    }

    /// Sum the N received shares into our share of the group secret.
    pub fn aggregate(&mut self) -> Result<GroupSecretShare, DkgError> {
        if let Some(share) = &self.group_share {
            return Ok(share.clone());
        }
        if !self.is_complete() {
            return Err(DkgError::IncompleteShares {
                have: self.received_shares.len(),
                need: self.config.n as usize,
            });
        }

        let sum = self
            .received_shares
            .values()
            .fold(Scalar::ZERO, |acc, share| acc + share);
        let share = GroupSecretShare::new(self.config.epoch, sum);
        self.group_share = Some(share.clone());

        info!(
            party = self.me.get(),
            epoch = self.config.epoch,
            "Aggregated group secret share"
        );
        Ok(share)
    }

    pub fn group_secret_share(&self) -> Option<&GroupSecretShare> {
        self.group_share.as_ref()
    }

    /// Public commitments to our polynomial coefficients.
    pub fn publish_vvec(&self) -> VerificationVector {
        VerificationVector::from_points(&generate_commitments(&self.polynomial))
    }

    /// Element-wise sum of all N participants' verification vectors.
    pub fn combine_vvecs(
        &self,
        vvecs: &[VerificationVector],
    ) -> Result<GroupVerificationVector, DkgError> {
        combine_vvecs(&self.config, vvecs)
    }
}

/// Combine verification vectors for an epoch without an engine instance.
pub fn combine_vvecs(
    config: &DkgConfig,
    vvecs: &[VerificationVector],
) -> Result<GroupVerificationVector, DkgError> {
    let points = vvecs
        .iter()
        .map(VerificationVector::to_points)
        .collect::<Result<Vec<_>, _>>()?;
    let combined = combine_commitments(&points, config.n as usize, config.threshold as usize)?;
    Ok(VerificationVector::from_points(&combined))
}

fn check_party(config: &DkgConfig, party: PartyId) -> Result<(), DkgError> {
    if party.get() > config.n {
        return Err(DkgError::InvalidIdentity(format!(
            "party {party} outside 1..={}",
            config.n
        )));
    }
    Ok(())
}
