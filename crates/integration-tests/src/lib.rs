//! End-to-end integration tests for the random beacon.
//!
//! These tests exercise the full protocol:
//! 1. DKG share exchange and aggregation
//! 2. Threshold signing and recovery of round signatures
//! 3. Coordinator behaviour under bad, duplicated and missing messages
//! 4. In-process nodes running epochs over an in-memory network

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use beacon_coordinator::{
    ExchangePhase, InMemoryNetwork, MessageRouter, RecordingNetwork, RoundPhase,
    RoundSignatureCoordinator, ShareExchangeCoordinator, SignerIdentity,
};
use beacon_crypto::bls::{
    commit, scalar_from_decimal, scalar_to_decimal, signature_from_hex, signature_to_hex,
};
use beacon_crypto::{recover_signature, CryptoError, ThresholdSigner};
use beacon_dkg::feldman::combine_shares;
use beacon_dkg::{DkgConfig, DkgEngine, GroupSecretShare, ShareOutcome, VerificationVector};
use beacon_node::{simulate, SimulationOptions};
use beacon_types::{round_message, PartyId, ProtocolMessage, GENESIS_RANDOM_SEED};

use bls12_381::{G1Affine, G2Projective, Scalar};
use ff::Field;
use group::Curve;
use rand::rngs::OsRng;
use tokio::sync::watch;

fn party(i: u32) -> PartyId {
    PartyId::new(i).unwrap()
}

/// Outcome of a complete N-of-N DKG run on bare engines.
struct Epoch {
    shares: Vec<(PartyId, Scalar)>,
    group_vvec: Vec<G2Projective>,
}

fn run_dkg(n: u32, t: u32) -> Epoch {
    let config = DkgConfig::new(n, t, 1).unwrap();
    let mut engines: Vec<DkgEngine> = (1..=n)
        .map(|i| DkgEngine::initialize(config, party(i), &mut OsRng).unwrap())
        .collect();

    let vvecs: Vec<VerificationVector> = engines.iter().map(DkgEngine::publish_vvec).collect();
    for engine in &mut engines {
        for (i, vvec) in vvecs.iter().enumerate() {
            engine.register_peer_vvec(party(i as u32 + 1), vvec).unwrap();
        }
    }

    for sender in 0..engines.len() {
        let from = engines[sender].party();
        for (recipient, share) in engines[sender].compute_all_shares().unwrap() {
            engines[recipient.index()].accept_share(from, share).unwrap();
        }
    }

    let shares = engines
        .iter_mut()
        .map(|engine| {
            assert!(engine.is_complete());
            (engine.party(), *engine.aggregate().unwrap().scalar())
        })
        .collect();
    let group_vvec = engines[0].combine_vvecs(&vvecs).unwrap().to_points().unwrap();

    Epoch { shares, group_vvec }
}

/// Every k-element subset of `items`.
fn subsets<T: Clone>(items: &[T], k: usize) -> Vec<Vec<T>> {
    if k == 0 {
        return vec![Vec::new()];
    }
    if items.len() < k {
        return Vec::new();
    }
    let mut with_first: Vec<Vec<T>> = subsets(&items[1..], k - 1)
        .into_iter()
        .map(|mut rest| {
            rest.insert(0, items[0].clone());
            rest
        })
        .collect();
    with_first.extend(subsets(&items[1..], k));
    with_first
}

/// 2-of-3 DKG, every pair reconstructs the same secret.
#[test]
fn test_dkg_two_of_three() {
    let epoch = run_dkg(3, 2);

    let secrets: Vec<Scalar> = subsets(&epoch.shares, 2)
        .iter()
        .map(|pair| combine_shares(pair).unwrap())
        .collect();
    assert_eq!(secrets.len(), 3);
    assert!(secrets.iter().all(|s| *s == secrets[0]));

    // The constant term of the group vvec commits to that secret.
    assert_eq!(
        commit(&secrets[0]).to_affine(),
        epoch.group_vvec[0].to_affine()
    );
}

/// Any T of N aggregated shares form a sharing of one secret.
#[test]
fn test_dkg_consistency_across_sizes() {
    for (n, t) in [(1, 1), (4, 1), (4, 4), (5, 3)] {
        let epoch = run_dkg(n, t);
        let reference = combine_shares(&epoch.shares[..t as usize]).unwrap();
        for subset in subsets(&epoch.shares, t as usize) {
            assert_eq!(combine_shares(&subset).unwrap(), reference, "n={n} t={t}");
        }
    }
}

/// 2-of-3 parties sign; recovery verifies, one share is not enough.
#[test]
fn test_threshold_signature_two_of_three() {
    let epoch = run_dkg(3, 2);
    let signer = ThresholdSigner::new(2, epoch.group_vvec.clone()).unwrap();
    let message = b"round:5|seed:abc";

    let mut verified: BTreeMap<PartyId, G1Affine> = BTreeMap::new();
    for (id, share) in &epoch.shares {
        let encoded = signature_to_hex(&signer.sign(share, message));
        let decoded = signer.verify_share(&encoded, *id, message).unwrap();
        verified.insert(*id, decoded);
    }

    let ids: Vec<PartyId> = verified.keys().copied().collect();
    let mut signatures = Vec::new();
    for pair in subsets(&ids, 2) {
        let subset: BTreeMap<PartyId, G1Affine> =
            pair.iter().map(|id| (*id, verified[id])).collect();
        let signature = signer.recover(&subset).unwrap();
        signer.verify_group_signature(&signature, message).unwrap();
        signatures.push(signature);
    }
    assert!(signatures.iter().all(|s| *s == signatures[0]));

    let single: BTreeMap<PartyId, G1Affine> = verified.into_iter().take(1).collect();
    assert_eq!(
        signer.recover(&single),
        Err(CryptoError::InsufficientShares {
            required: 2,
            got: 1
        })
    );
}

/// T-1 shares never yield a signature.
#[test]
fn test_recover_below_threshold() {
    for (n, t) in [(2, 2), (5, 3), (5, 5)] {
        let epoch = run_dkg(n, t);
        let message = round_message(1, GENESIS_RANDOM_SEED);
        let shares: BTreeMap<PartyId, G1Affine> = epoch
            .shares
            .iter()
            .take(t as usize - 1)
            .map(|(id, share)| (*id, beacon_crypto::threshold::sign_share(share, &message)))
            .collect();

        assert!(matches!(
            recover_signature(&shares, t as usize),
            Err(CryptoError::InsufficientShares { .. })
        ));
    }
}

/// Verification fails closed when there is nothing to verify against.
#[test]
fn test_empty_group_vvec_rejects_everything() {
    let signer = ThresholdSigner::new(1, Vec::new()).unwrap();
    let share = signature_to_hex(&beacon_crypto::threshold::sign_share(&Scalar::ONE, b"m"));
    assert_eq!(
        signer.verify_share(&share, party(1), b"m"),
        Err(CryptoError::EmptyVerificationVector)
    );
}

/// A repeated DKG share does not change the aggregate.
#[test]
fn test_duplicate_dkg_share_is_idempotent() {
    let config = DkgConfig::new(3, 2, 1).unwrap();
    let mut engines: Vec<DkgEngine> = (1..=3)
        .map(|i| DkgEngine::initialize(config, party(i), &mut OsRng).unwrap())
        .collect();
    let for_one: Vec<Scalar> = engines
        .iter_mut()
        .map(|engine| engine.share_for(party(1)).unwrap())
        .collect();

    let receiver = &mut engines[0];
    receiver.accept_share(party(1), for_one[0]).unwrap();
    receiver.accept_share(party(2), for_one[1]).unwrap();
    assert_eq!(
        receiver.accept_share(party(2), for_one[1]).unwrap(),
        ShareOutcome::Duplicate
    );
    receiver.accept_share(party(3), for_one[2]).unwrap();
    assert_eq!(
        receiver
            .accept_encoded_share(party(2), &scalar_to_decimal(&for_one[1]))
            .unwrap(),
        ShareOutcome::Duplicate
    );

    let expected = for_one[0] + for_one[1] + for_one[2];
    assert_eq!(*receiver.aggregate().unwrap().scalar(), expected);
}

/// A corrupted signature share is logged and dropped by the router.
#[test]
fn test_corrupted_signature_share_is_dropped() {
    let epoch = run_dkg(3, 3);
    let network = Arc::new(RecordingNetwork::new());
    let signer = ThresholdSigner::new(3, epoch.group_vvec.clone()).unwrap();
    let identity = SignerIdentity {
        epoch: 1,
        party: party(1),
        n: 3,
    };
    let rounds = Arc::new(
        RoundSignatureCoordinator::new(
            identity,
            signer,
            GroupSecretShare::new(1, epoch.shares[0].1),
            network,
            4,
        )
        .unwrap(),
    );
    let router = MessageRouter::new(party(1), 3);
    router.attach_rounds(rounds.clone());

    rounds.begin_round(1, None).unwrap();
    assert_eq!(rounds.valid_share_count(), 1);

    let corrupted = vec![
        String::new(),
        "zz".to_string(),
        "00".repeat(48),
        "ab".repeat(49),
    ];
    for share in corrupted {
        let message = ProtocolMessage::SignatureShare {
            epoch: 1,
            round: 1,
            sender: party(2),
            share,
        };
        assert!(router.handle(&message.encode().unwrap()).is_err());
    }
    assert!(router.handle(b"garbage").is_err());

    assert_eq!(rounds.valid_share_count(), 1);
    assert_eq!(rounds.phase(), RoundPhase::CollectingShares);
}

/// T-1 shares leave the round pending until cancelled.
#[tokio::test]
async fn test_round_below_threshold_waits_for_cancellation() {
    let epoch = run_dkg(4, 3);
    let signer = ThresholdSigner::new(3, epoch.group_vvec.clone()).unwrap();
    let identity = SignerIdentity {
        epoch: 1,
        party: party(1),
        n: 4,
    };
    let rounds = RoundSignatureCoordinator::new(
        identity,
        signer,
        GroupSecretShare::new(1, epoch.shares[0].1),
        Arc::new(RecordingNetwork::new()),
        4,
    )
    .unwrap();

    rounds.begin_round(1, None).unwrap();
    let message = round_message(1, GENESIS_RANDOM_SEED);
    let share = beacon_crypto::threshold::sign_share(&epoch.shares[1].1, &message);
    rounds
        .on_signature_share_received(1, 1, party(2), &signature_to_hex(&share))
        .unwrap();
    assert_eq!(rounds.valid_share_count(), 2);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let waiter = rounds.wait_for_beacon(1, shutdown_rx);
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
    };
    let (result, _) = tokio::join!(waiter, cancel);

    assert!(matches!(
        result,
        Err(beacon_coordinator::CoordinatorError::Cancelled)
    ));
    assert_eq!(rounds.phase(), RoundPhase::CollectingShares);
    assert!(rounds.latest_beacon().is_none());
}

/// DKG over the in-memory network with every message delivered twice.
#[tokio::test]
async fn test_share_exchange_over_duplicating_network() {
    let n = 4;
    let config = DkgConfig::new(n, 3, 9).unwrap();
    let network = InMemoryNetwork::new();
    network.set_duplicate_delivery(true);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut exchanges = Vec::new();
    let mut tasks = Vec::new();
    for i in 1..=n {
        let engine = DkgEngine::initialize(config, party(i), &mut OsRng).unwrap();
        let exchange = Arc::new(ShareExchangeCoordinator::new(
            engine,
            Arc::new(network.endpoint(party(i))),
        ));
        let router = Arc::new(MessageRouter::with_shares(exchange.clone()));
        let inbox = network.register(party(i));
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { router.run(inbox, shutdown).await }));
        exchanges.push(exchange);
    }
    for exchange in &exchanges {
        exchange.start().unwrap();
    }

    let mut shares = Vec::new();
    for exchange in &exchanges {
        let share = tokio::time::timeout(
            Duration::from_secs(5),
            exchange.wait_for_group_share(shutdown_rx.clone()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(exchange.phase(), ExchangePhase::Aggregated);
        shares.push((exchange.party(), *share.scalar()));
    }

    let secret = combine_shares(&shares[..3]).unwrap();
    assert_eq!(combine_shares(&shares[1..]).unwrap(), secret);

    shutdown_tx.send(true).unwrap();
    for task in tasks {
        task.await.unwrap();
    }
}

/// Full epochs through the node simulator: fresh DKG, then a restart from checkpoints.
#[tokio::test]
async fn test_simulated_epoch_with_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = beacon_coordinator::ProtocolConfig {
        threshold: 3,
        participants: (1..=5).map(|i| format!("miner-{i}")).collect(),
        network_delay_ms: 5,
        retransmit_factor: 2,
        max_buffered_rounds: 4,
    };

    // Two silent parties still leave exactly T senders.
    let options = SimulationOptions {
        rounds: 3,
        silent: vec![party(4), party(5)],
        duplicate: true,
        ..Default::default()
    };
    let report = simulate(&config, dir.path(), &options).await.unwrap();
    assert!(!report.restored);
    assert_eq!(report.stalled_round, None);
    let rounds: Vec<u64> = report.beacons.iter().map(|b| b.round).collect();
    assert_eq!(rounds, vec![1, 2, 3]);

    let restart = SimulationOptions {
        start_round: 4,
        rounds: 1,
        ..Default::default()
    };
    let resumed = simulate(&config, dir.path(), &restart).await.unwrap();
    assert!(resumed.restored);
    assert_eq!(resumed.beacons[0].round, 4);
    assert_ne!(resumed.beacons[0].seed, report.beacons[2].seed);
}
