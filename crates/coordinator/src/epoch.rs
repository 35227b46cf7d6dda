//! Public per-epoch metadata exchanged out of band.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use beacon_crypto::ThresholdSigner;
use beacon_dkg::engine::combine_vvecs;
use beacon_dkg::{DkgConfig, GroupVerificationVector, PartyRoster, VerificationVector};
use beacon_types::{EpochId, PartyId};

use crate::error::CoordinatorError;

/// A participant's published verification vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyVvec {
    pub party: PartyId,
    pub vvec: VerificationVector,
}

/// Magic-block data needed to rebuild an epoch's signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochMetadata {
    pub epoch: EpochId,
    pub threshold: u32,
    /// Ordered node identifiers; PartyIDs follow this order
    pub participants: Vec<String>,
    pub vvecs: Vec<PartyVvec>,
}

impl EpochMetadata {
    pub fn roster(&self) -> PartyRoster {
        PartyRoster::from_node_ids(&self.participants)
    }

    pub fn dkg_config(&self) -> Result<DkgConfig, CoordinatorError> {
        let n = u32::try_from(self.roster().len())
            .map_err(|_| CoordinatorError::InvalidConfig("too many participants".to_string()))?;
        Ok(DkgConfig::new(n, self.threshold, self.epoch)?)
    }

    /// Combine every participant's vector, exactly one per PartyID.
    pub fn group_vvec(&self) -> Result<GroupVerificationVector, CoordinatorError> {
        let config = self.dkg_config()?;
        let mut seen = BTreeSet::new();
        for entry in &self.vvecs {
            if entry.party.get() > config.n || !seen.insert(entry.party) {
                return Err(CoordinatorError::UnknownParty(entry.party.get()));
            }
        }

        let mut ordered: Vec<&PartyVvec> = self.vvecs.iter().collect();
        ordered.sort_by_key(|entry| entry.party);
        let vvecs: Vec<VerificationVector> =
            ordered.into_iter().map(|entry| entry.vvec.clone()).collect();
        Ok(combine_vvecs(&config, &vvecs)?)
    }

    pub fn signer(&self) -> Result<ThresholdSigner, CoordinatorError> {
        let points = self.group_vvec()?.to_points()?;
        Ok(ThresholdSigner::new(self.threshold as usize, points)?)
    }
}
