//! Threshold BLS signature operations for the random beacon.
//!
//! In a (t, n) threshold scheme:
//! - n participants each hold a share sk_i of the group secret
//! - Any t participants can produce the group signature
//! - Fewer than t participants learn nothing about it
//!
//! # Partial Signature
//!
//! For round message `m`, participant i computes:
//! σ_i = sk_i · H(m)
//!
//! # Verification
//!
//! The group verification vector commits to the aggregate polynomial, so the
//! public key of participant i is pk_i = Σ_k V_k · i^k and σ_i verifies as a
//! plain BLS signature under pk_i.
//!
//! # Recovery
//!
//! Given t partial signatures, compute:
//! σ = Σ λ_i · σ_i
//!
//! where λ_i are Lagrange coefficients at zero. The beacon output is the
//! SHA-256 digest of the compressed σ.

use std::collections::BTreeMap;

use bls12_381::{G1Affine, G1Projective, G2Affine, G2Projective, Scalar};
use ff::Field;
use group::Curve;

use beacon_types::{sha256, PartyId, RandomSeed};

use crate::bls::{hash_to_g1, party_scalar, signature_from_hex, verify_signature};
use crate::error::CryptoError;

/// Per-epoch signer, reusable across rounds.
///
/// Holds the threshold and the group verification vector; the secret share
/// is passed per call so that the signer itself can be shared freely.
#[derive(Clone, Debug)]
pub struct ThresholdSigner {
    threshold: usize,
    group_vvec: Vec<G2Projective>,
}

impl ThresholdSigner {
    pub fn new(threshold: usize, group_vvec: Vec<G2Projective>) -> Result<Self, CryptoError> {
        if threshold == 0 {
            return Err(CryptoError::InvalidThreshold(threshold));
        }
        Ok(Self {
            threshold,
            group_vvec,
        })
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Group public key, the constant term of the group verification vector.
    pub fn group_public_key(&self) -> Result<G2Affine, CryptoError> {
        self.group_vvec
            .first()
            .map(|pk| pk.to_affine())
            .ok_or(CryptoError::EmptyVerificationVector)
    }

    /// Deterministic BLS signature share over `message`.
    pub fn sign(&self, group_secret_share: &Scalar, message: &[u8]) -> G1Affine {
        sign_share(group_secret_share, message)
    }

    /// Verify a hex-encoded signature share from `sender`.
    ///
    /// Fails closed on an empty verification vector. Returns the decoded
    /// share so callers do not have to parse it twice.
    pub fn verify_share(
        &self,
        encoded: &str,
        sender: PartyId,
        message: &[u8],
    ) -> Result<G1Affine, CryptoError> {
        // Checked first so an empty vector fails closed even on garbage input.
        let public_key = public_key_share(&self.group_vvec, sender)?.to_affine();
        let share =
            signature_from_hex(encoded).map_err(|e| CryptoError::MalformedShare(e.to_string()))?;

        if !verify_signature(&share, message, &public_key) {
            return Err(CryptoError::SignatureMismatch(sender.get()));
        }
        Ok(share)
    }

    /// Verify an already decoded signature share from `sender`.
    pub fn verify_decoded_share(
        &self,
        share: &G1Affine,
        sender: PartyId,
        message: &[u8],
    ) -> Result<(), CryptoError> {
        let public_key = public_key_share(&self.group_vvec, sender)?.to_affine();
        if verify_signature(share, message, &public_key) {
            Ok(())
        } else {
            Err(CryptoError::SignatureMismatch(sender.get()))
        }
    }

    /// Recover the group signature from at least `threshold` shares.
    pub fn recover(&self, shares: &BTreeMap<PartyId, G1Affine>) -> Result<G1Affine, CryptoError> {
        recover_signature(shares, self.threshold)
    }

    /// Check a recovered signature against the group public key.
    pub fn verify_group_signature(
        &self,
        signature: &G1Affine,
        message: &[u8],
    ) -> Result<(), CryptoError> {
        let group_public_key = self.group_public_key()?;
        if verify_signature(signature, message, &group_public_key) {
            Ok(())
        } else {
            Err(CryptoError::GroupSignatureMismatch)
        }
    }
}

/// σ_i = sk_i · H(m)
pub fn sign_share(secret_share: &Scalar, message: &[u8]) -> G1Affine {
    (G1Projective::from(hash_to_g1(message)) * secret_share).to_affine()
}

/// Evaluate a verification vector at a party's point: Σ_k V_k · x^k.
pub fn public_key_share(
    vvec: &[G2Projective],
    party: PartyId,
) -> Result<G2Projective, CryptoError> {
    if vvec.is_empty() {
        return Err(CryptoError::EmptyVerificationVector);
    }

    let x = party_scalar(party);
    let mut result = G2Projective::identity();
    for commitment in vvec.iter().rev() {
        result = result * x + commitment;
    }
    Ok(result)
}

/// Recover the group signature using Lagrange interpolation.
///
/// Uses the `threshold` lowest PartyIDs present in `shares`, so the result
/// does not depend on arrival order. Any t valid shares yield the same
/// signature.
pub fn recover_signature(
    shares: &BTreeMap<PartyId, G1Affine>,
    threshold: usize,
) -> Result<G1Affine, CryptoError> {
    if threshold == 0 {
        return Err(CryptoError::InvalidThreshold(threshold));
    }
    if shares.len() < threshold {
        return Err(CryptoError::InsufficientShares {
            required: threshold,
            got: shares.len(),
        });
    }

    let selected: Vec<(PartyId, &G1Affine)> = shares
        .iter()
        .take(threshold)
        .map(|(party, share)| (*party, share))
        .collect();
    let indices: Vec<PartyId> = selected.iter().map(|(party, _)| *party).collect();

    let mut result = G1Projective::identity();
    for (party, share) in &selected {
        let lambda = lagrange_coefficient(*party, &indices)?;
        result += G1Projective::from(*share) * lambda;
    }

    Ok(result.to_affine())
}

/// Compute Lagrange coefficient for index i given all indices.
///
/// λ_i = Π_{j≠i} (x_j / (x_j - x_i))
///
/// where we evaluate at x=0 for secret reconstruction.
pub fn lagrange_coefficient(i: PartyId, indices: &[PartyId]) -> Result<Scalar, CryptoError> {
    let i_scalar = party_scalar(i);
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;

    for &j in indices {
        if j == i {
            continue;
        }

        let j_scalar = party_scalar(j);
        numerator *= j_scalar;
        denominator *= j_scalar - i_scalar;
    }

    Option::<Scalar>::from(denominator.invert())
        .map(|inverse| numerator * inverse)
        .ok_or(CryptoError::LagrangeInterpolationFailed)
}

/// Pseudorandom output of a round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RandomBeacon {
    /// SHA-256 of the compressed group signature.
    pub output: [u8; 32],
    /// First eight bytes of `output`, big-endian, as the round's seed.
    pub seed: RandomSeed,
}

/// Hash the canonical serialization of the group signature into the beacon.
pub fn derive_beacon(group_signature: &G1Affine) -> RandomBeacon {
    let output = sha256(&group_signature.to_compressed());
    let mut head = [0u8; 8];
    head.copy_from_slice(&output[..8]);
    RandomBeacon {
        output,
        seed: RandomSeed(i64::from_be_bytes(head)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bls::{commit, random_scalar, signature_to_hex};
    use rand::rngs::OsRng;

    fn party(i: u32) -> PartyId {
        PartyId::new(i).unwrap()
    }

    /// Single-dealer Shamir sharing, enough to exercise signing and recovery.
    fn deal(threshold: usize, n: u32) -> (Scalar, Vec<G2Projective>, Vec<(PartyId, Scalar)>) {
        let coeffs: Vec<Scalar> = (0..threshold).map(|_| random_scalar(&mut OsRng)).collect();
        let vvec = coeffs.iter().map(commit).collect();
        let shares = (1..=n)
            .map(|i| {
                let x = party_scalar(party(i));
                let share = coeffs
                    .iter()
                    .rev()
                    .fold(Scalar::ZERO, |acc, coeff| acc * x + coeff);
                (party(i), share)
            })
            .collect();
        (coeffs[0], vvec, shares)
    }

    #[test]
    fn test_lagrange_coefficient() {
        let indices = vec![party(1), party(2), party(3)];

        let l1 = lagrange_coefficient(party(1), &indices).unwrap();
        let l2 = lagrange_coefficient(party(2), &indices).unwrap();
        let l3 = lagrange_coefficient(party(3), &indices).unwrap();

        // l1 = 3, l2 = -3, l3 = 1
        assert_eq!(l1, Scalar::from(3u64));
        assert_eq!(l2, -Scalar::from(3u64));
        assert_eq!(l3, Scalar::ONE);
        assert_eq!(l1 + l2 + l3, Scalar::ONE);
    }

    #[test]
    fn test_verify_share() {
        let (_, vvec, shares) = deal(2, 3);
        let signer = ThresholdSigner::new(2, vvec).unwrap();
        let message = b"round:5|seed:abc";

        for (id, share) in &shares {
            let sig = signer.sign(share, message);
            let decoded = signer.verify_share(&signature_to_hex(&sig), *id, message).unwrap();
            assert_eq!(decoded, sig);
        }

        // A valid share attributed to the wrong sender does not verify.
        let sig = signer.sign(&shares[0].1, message);
        assert_eq!(
            signer.verify_share(&signature_to_hex(&sig), party(2), message),
            Err(CryptoError::SignatureMismatch(2))
        );
        assert_eq!(
            signer.verify_decoded_share(&sig, party(2), message),
            Err(CryptoError::SignatureMismatch(2))
        );
        assert_eq!(signer.verify_decoded_share(&sig, party(1), message), Ok(()));
    }

    #[test]
    fn test_verify_share_fails_closed_on_empty_vvec() {
        let signer = ThresholdSigner::new(2, Vec::new()).unwrap();
        let sig = sign_share(&Scalar::ONE, b"m");
        assert_eq!(
            signer.verify_share(&signature_to_hex(&sig), party(1), b"m"),
            Err(CryptoError::EmptyVerificationVector)
        );
    }

    #[test]
    fn test_verify_share_malformed() {
        let (_, vvec, _) = deal(2, 3);
        let signer = ThresholdSigner::new(2, vvec).unwrap();
        assert!(matches!(
            signer.verify_share("zz-not-hex", party(1), b"m"),
            Err(CryptoError::MalformedShare(_))
        ));
    }

    #[test]
    fn test_recover_matches_master_signature() {
        let (master, vvec, shares) = deal(3, 5);
        let signer = ThresholdSigner::new(3, vvec).unwrap();
        let message = b"round:9|seed:1";
        let expected = sign_share(&master, message);

        let all: BTreeMap<PartyId, G1Affine> = shares
            .iter()
            .map(|(id, share)| (*id, signer.sign(share, message)))
            .collect();

        let low: BTreeMap<_, _> = all.iter().take(3).map(|(k, v)| (*k, *v)).collect();
        let high: BTreeMap<_, _> = all.iter().skip(2).map(|(k, v)| (*k, *v)).collect();

        assert_eq!(signer.recover(&low).unwrap(), expected);
        assert_eq!(signer.recover(&high).unwrap(), expected);
        assert_eq!(signer.recover(&all).unwrap(), expected);
        assert!(signer.verify_group_signature(&expected, message).is_ok());
    }

    #[test]
    fn test_insufficient_shares_fails() {
        let (_, vvec, shares) = deal(2, 3);
        let signer = ThresholdSigner::new(2, vvec).unwrap();
        let one: BTreeMap<_, _> = shares
            .iter()
            .take(1)
            .map(|(id, share)| (*id, signer.sign(share, b"m")))
            .collect();

        assert_eq!(
            signer.recover(&one),
            Err(CryptoError::InsufficientShares { required: 2, got: 1 })
        );
        assert_eq!(
            recover_signature(&BTreeMap::new(), 1),
            Err(CryptoError::InsufficientShares { required: 1, got: 0 })
        );
    }

    #[test]
    fn test_derive_beacon_is_deterministic() {
        let sig = sign_share(&Scalar::from(42u64), b"round:1|seed:0");
        let a = derive_beacon(&sig);
        let b = derive_beacon(&sig);
        assert_eq!(a, b);

        let mut head = [0u8; 8];
        head.copy_from_slice(&a.output[..8]);
        assert_eq!(a.seed, RandomSeed(i64::from_be_bytes(head)));

        let other = derive_beacon(&sign_share(&Scalar::from(43u64), b"round:1|seed:0"));
        assert_ne!(a.output, other.output);
    }

    #[test]
    fn test_zero_threshold_rejected() {
        assert_eq!(
            ThresholdSigner::new(0, Vec::new()).unwrap_err(),
            CryptoError::InvalidThreshold(0)
        );
    }
}
