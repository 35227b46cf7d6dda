//! Feldman Verifiable Secret Sharing.
//!
//! Extends Shamir's secret sharing with commitments that allow
//! verification of shares without revealing the secret.

use bls12_381::{G2Projective, Scalar};
use ff::Field;
use rand::{CryptoRng, RngCore};

use beacon_crypto::bls::{commit, party_scalar, random_scalar};
use beacon_crypto::threshold::{lagrange_coefficient, public_key_share};
use beacon_types::PartyId;

use crate::engine::DkgError;

/// Generate a random polynomial of degree t-1.
///
/// Returns coefficients [a_0, a_1, ..., a_{t-1}] where a_0 is this
/// participant's contribution to the group secret and
/// f(x) = a_0 + a_1*x + a_2*x^2 + ... + a_{t-1}*x^{t-1}
pub fn generate_polynomial<R: RngCore + CryptoRng>(degree: usize, rng: &mut R) -> Vec<Scalar> {
    (0..degree).map(|_| random_scalar(rng)).collect()
}

/// Evaluate polynomial at a point.
///
/// f(x) = a_0 + a_1*x + a_2*x^2 + ... using Horner's method
pub fn evaluate_polynomial(coefficients: &[Scalar], x: &Scalar) -> Scalar {
    let mut result = Scalar::ZERO;
    for coeff in coefficients.iter().rev() {
        result = result * x + coeff;
    }
    result
}

/// Generate Feldman commitments for polynomial coefficients.
///
/// C_i = g^{a_i} for each coefficient a_i
pub fn generate_commitments(coefficients: &[Scalar]) -> Vec<G2Projective> {
    coefficients.iter().map(commit).collect()
}

/// Verify a share against Feldman commitments.
///
/// Checks that g^{share} = Π C_i^{x^i}
pub fn verify_share(share: &Scalar, recipient: PartyId, commitments: &[G2Projective]) -> bool {
    match public_key_share(commitments, recipient) {
        Ok(expected) => commit(share) == expected,
        Err(_) => false,
    }
}

/// Element-wise sum of `n` verification vectors of length `threshold`.
pub fn combine_commitments(
    vvecs: &[Vec<G2Projective>],
    n: usize,
    threshold: usize,
) -> Result<Vec<G2Projective>, DkgError> {
    if vvecs.len() != n {
        return Err(DkgError::VerificationVectorCount {
            expected: n,
            got: vvecs.len(),
        });
    }
    if let Some(bad) = vvecs.iter().find(|v| v.len() != threshold) {
        return Err(DkgError::VerificationVectorLength {
            expected: threshold,
            got: bad.len(),
        });
    }

    let mut combined = vec![G2Projective::identity(); threshold];
    for vvec in vvecs {
        for (sum, commitment) in combined.iter_mut().zip(vvec) {
            *sum += commitment;
        }
    }
    Ok(combined)
}

/// Combine shares using Lagrange interpolation to reconstruct secret.
///
/// Given shares (x_i, y_i), computes f(0) = Σ y_i * λ_i
pub fn combine_shares(shares: &[(PartyId, Scalar)]) -> Option<Scalar> {
    if shares.is_empty() {
        return None;
    }

    let indices: Vec<PartyId> = shares.iter().map(|(party, _)| *party).collect();
    let mut result = Scalar::ZERO;
    for (party, y) in shares {
        let lambda = lagrange_coefficient(*party, &indices).ok()?;
        result += y * lambda;
    }
    Some(result)
}

/// Share of `party` under `coefficients`.
pub fn share_for(coefficients: &[Scalar], party: PartyId) -> Scalar {
    evaluate_polynomial(coefficients, &party_scalar(party))
}
