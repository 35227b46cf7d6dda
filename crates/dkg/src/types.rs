//! DKG type definitions.

use std::fmt;

use bls12_381::{G2Projective, Scalar};
use group::Curve;
use serde::{Deserialize, Serialize};

use beacon_crypto::bls::{compress_g2, decompress_g2, scalar_from_hex, scalar_to_hex};
use beacon_types::{EpochId, G2Point};

use crate::engine::DkgError;

/// DKG configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DkgConfig {
    /// Total number of participants
    pub n: u32,
    /// Threshold (minimum shares needed to sign)
    pub threshold: u32,
    /// Epoch the resulting keys are bound to
    pub epoch: EpochId,
}

impl DkgConfig {
    pub fn new(n: u32, threshold: u32, epoch: EpochId) -> Result<Self, DkgError> {
        if threshold == 0 || threshold > n {
            return Err(DkgError::InvalidConfig(format!(
                "threshold {threshold} must be within 1..={n}"
            )));
        }
        Ok(Self {
            n,
            threshold,
            epoch,
        })
    }
}

/// Feldman commitments g2^{a_k} to a polynomial's coefficients, in order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VerificationVector {
    pub commitments: Vec<G2Point>,
}

/// Element-wise sum of every participant's verification vector.
pub type GroupVerificationVector = VerificationVector;

impl VerificationVector {
    pub fn from_points(points: &[G2Projective]) -> Self {
        Self {
            commitments: points.iter().map(|p| compress_g2(&p.to_affine())).collect(),
        }
    }

    /// Decompress every commitment; any invalid point fails the whole vector.
    pub fn to_points(&self) -> Result<Vec<G2Projective>, DkgError> {
        self.commitments
            .iter()
            .map(|c| decompress_g2(c).map(G2Projective::from))
            .collect::<Result<_, _>>()
            .map_err(DkgError::from)
    }

    pub fn len(&self) -> usize {
        self.commitments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commitments.is_empty()
    }
}

/// This participant's share of the group secret, bound to one epoch.
#[derive(Clone, PartialEq, Eq)]
pub struct GroupSecretShare {
    epoch: EpochId,
    scalar: Scalar,
}

impl GroupSecretShare {
    pub fn new(epoch: EpochId, scalar: Scalar) -> Self {
        Self { epoch, scalar }
    }

    pub fn epoch(&self) -> EpochId {
        self.epoch
    }

    pub fn scalar(&self) -> &Scalar {
        &self.scalar
    }

    pub fn to_hex(&self) -> String {
        scalar_to_hex(&self.scalar)
    }

    pub fn from_hex(epoch: EpochId, s: &str) -> Result<Self, DkgError> {
        Ok(Self::new(epoch, scalar_from_hex(s)?))
    }
}

impl fmt::Debug for GroupSecretShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupSecretShare")
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_crypto::bls::commit;

    #[test]
    fn test_config_bounds() {
        assert!(DkgConfig::new(3, 2, 1).is_ok());
        assert!(DkgConfig::new(3, 3, 1).is_ok());
        assert!(DkgConfig::new(1, 1, 1).is_ok());
        assert!(matches!(DkgConfig::new(3, 0, 1), Err(DkgError::InvalidConfig(_))));
        assert!(matches!(DkgConfig::new(3, 4, 1), Err(DkgError::InvalidConfig(_))));
    }

    #[test]
    fn test_vvec_json_roundtrip() {
        let points = vec![commit(&Scalar::from(5u64)), commit(&Scalar::from(9u64))];
        let vvec = VerificationVector::from_points(&points);
        let json = serde_json::to_string(&vvec).unwrap();
        let decoded: VerificationVector = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, vvec);
        assert_eq!(decoded.to_points().unwrap(), points);
    }

    #[test]
    fn test_vvec_rejects_invalid_point() {
        let vvec = VerificationVector {
            commitments: vec![G2Point([0u8; 96])],
        };
        assert!(vvec.to_points().is_err());
    }

    #[test]
    fn test_group_secret_share_hex() {
        let share = GroupSecretShare::new(4, Scalar::from(77u64));
        let restored = GroupSecretShare::from_hex(4, &share.to_hex()).unwrap();
        assert_eq!(restored, share);
        assert!(!format!("{share:?}").contains(&share.to_hex()));
    }
}
