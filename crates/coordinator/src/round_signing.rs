//! Per-round threshold signing.
//!
//! Each round walks `AwaitPreviousSeed -> Signing -> CollectingShares ->
//! Recovered`. The round message needs the previous round's seed, so a round
//! whose predecessor has not been recovered yet waits in `AwaitPreviousSeed`.
//! Signature shares that arrive before their round's message is known are
//! buffered and verified once it is.
//!
//! A round that never collects `threshold` valid shares stays in
//! `CollectingShares`; timeouts and view changes are up to the caller.

use std::collections::BTreeMap;
use std::sync::Arc;

use bls12_381::G1Affine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use beacon_crypto::bls::{compress_g1, signature_from_hex, signature_to_hex};
use beacon_crypto::{derive_beacon, CryptoError, ThresholdSigner};
use beacon_dkg::GroupSecretShare;
use beacon_types::{
    round_message, seed_for_round, EpochId, G1Point, PartyId, ProtocolMessage, RandomSeed, Round,
};

use crate::error::CoordinatorError;
use crate::network::{send_message, PeerNetwork};

/// Distinct unverified shares kept per sender and round.
const MAX_PENDING_PER_SENDER: usize = 4;

/// Phase of the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    AwaitPreviousSeed,
    Signing,
    CollectingShares,
    Recovered,
}

/// What happened to an inbound signature share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureShareOutcome {
    /// Verified and counted towards the threshold
    Accepted,
    /// The sender already contributed to this round
    Duplicate,
    /// Held until the round's message is known
    Buffered,
    /// Past round, the round is already recovered, or the sender's
    /// buffer for that round is full
    Ignored,
}

/// Published output of a recovered round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundBeacon {
    pub round: Round,
    pub signature: G1Point,
    pub output: [u8; 32],
    pub seed: RandomSeed,
}

struct RoundSession {
    round: Round,
    phase: RoundPhase,
    message: Option<Vec<u8>>,
    /// Verified shares for the current round, one per sender
    shares: BTreeMap<PartyId, G1Affine>,
    /// Decoded but unverified shares for rounds whose message is not known
    /// yet. A sender may have several candidates; the first that verifies
    /// on replay counts.
    pending: BTreeMap<Round, BTreeMap<PartyId, Vec<G1Affine>>>,
}

/// Identity of the local signer within an epoch.
#[derive(Debug, Clone, Copy)]
pub struct SignerIdentity {
    pub epoch: EpochId,
    pub party: PartyId,
    /// Number of participants in the epoch
    pub n: u32,
}

/// Round signature state machine for one epoch.
pub struct RoundSignatureCoordinator {
    identity: SignerIdentity,
    signer: ThresholdSigner,
    secret: GroupSecretShare,
    network: Arc<dyn PeerNetwork>,
    max_buffered_rounds: u64,
    session: Mutex<RoundSession>,
    beacon_tx: watch::Sender<Option<RoundBeacon>>,
}

impl RoundSignatureCoordinator {
    /// Fails with `EpochMismatch` if `secret` belongs to a different epoch.
    pub fn new(
        identity: SignerIdentity,
        signer: ThresholdSigner,
        secret: GroupSecretShare,
        network: Arc<dyn PeerNetwork>,
        max_buffered_rounds: u64,
    ) -> Result<Self, CoordinatorError> {
        if secret.epoch() != identity.epoch {
            return Err(CoordinatorError::EpochMismatch {
                expected: identity.epoch,
                got: secret.epoch(),
            });
        }
        if identity.party.get() > identity.n {
            return Err(CoordinatorError::UnknownParty(identity.party.get()));
        }
        signer.group_public_key()?;

        let (beacon_tx, _) = watch::channel(None);
        Ok(Self {
            identity,
            signer,
            secret,
            network,
            max_buffered_rounds,
            session: Mutex::new(RoundSession {
                round: 0,
                phase: RoundPhase::AwaitPreviousSeed,
                message: None,
                shares: BTreeMap::new(),
                pending: BTreeMap::new(),
            }),
            beacon_tx,
        })
    }

    pub fn party(&self) -> PartyId {
        self.identity.party
    }

    pub fn epoch(&self) -> EpochId {
        self.identity.epoch
    }

    pub fn current_round(&self) -> Round {
        self.session.lock().round
    }

    pub fn phase(&self) -> RoundPhase {
        self.session.lock().phase
    }

    /// Verified shares collected for the current round.
    pub fn valid_share_count(&self) -> usize {
        self.session.lock().shares.len()
    }

    pub fn latest_beacon(&self) -> Option<RoundBeacon> {
        self.beacon_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<RoundBeacon>> {
        self.beacon_tx.subscribe()
    }

    /// Enter `round`. Round 1 signs immediately with the genesis seed; later
    /// rounds need `previous_seed`, or wait for [`Self::provide_previous_seed`].
    pub fn begin_round(
        &self,
        round: Round,
        previous_seed: Option<RandomSeed>,
    ) -> Result<RoundPhase, CoordinatorError> {
        let (phase, outbound) = {
            let mut session = self.session.lock();
            if round < session.round {
                return Err(CoordinatorError::RoundMismatch {
                    current: session.round,
                    got: round,
                });
            }
            if round == session.round && session.message.is_some() {
                return Ok(session.phase);
            }

            session.round = round;
            session.phase = RoundPhase::AwaitPreviousSeed;
            session.message = None;
            session.shares.clear();
            session.pending = session.pending.split_off(&round);
            debug!(party = self.identity.party.get(), round, "Round started");

            match seed_for_round(round, previous_seed) {
                Some(seed) => {
                    let outbound = self.start_signing(&mut session, seed)?;
                    (session.phase, outbound)
                }
                None => (session.phase, None),
            }
        };

        if let Some(message) = outbound {
            self.broadcast(&message);
        }
        Ok(phase)
    }

    /// Enter the round after the most recently recovered one.
    pub fn begin_next_round(&self) -> Result<RoundPhase, CoordinatorError> {
        let next = self.current_round() + 1;
        let previous = self
            .latest_beacon()
            .filter(|beacon| beacon.round + 1 == next)
            .map(|beacon| beacon.seed);
        self.begin_round(next, previous)
    }

    /// Supply the previous round's seed to a round waiting for it.
    pub fn provide_previous_seed(
        &self,
        round: Round,
        seed: RandomSeed,
    ) -> Result<RoundPhase, CoordinatorError> {
        let (phase, outbound) = {
            let mut session = self.session.lock();
            if round != session.round {
                return Err(CoordinatorError::RoundMismatch {
                    current: session.round,
                    got: round,
                });
            }
            if session.phase != RoundPhase::AwaitPreviousSeed {
                return Ok(session.phase);
            }
            let outbound = self.start_signing(&mut session, seed)?;
            (session.phase, outbound)
        };

        if let Some(message) = outbound {
            self.broadcast(&message);
        }
        Ok(phase)
    }

    /// Handle a `SignatureShare` message.
    ///
    /// Invalid shares are logged and dropped without touching the count of
    /// valid shares.
    pub fn on_signature_share_received(
        &self,
        epoch: EpochId,
        round: Round,
        sender: PartyId,
        encoded: &str,
    ) -> Result<SignatureShareOutcome, CoordinatorError> {
        let me = self.identity.party.get();
        if epoch != self.identity.epoch {
            warn!(
                party = me,
                expected = self.identity.epoch,
                got = epoch,
                "Dropping signature share for another epoch"
            );
            return Err(CoordinatorError::EpochMismatch {
                expected: self.identity.epoch,
                got: epoch,
            });
        }
        if sender.get() > self.identity.n {
            warn!(
                party = me,
                sender = sender.get(),
                "Dropping signature share from unknown party"
            );
            return Err(CoordinatorError::UnknownParty(sender.get()));
        }
        let share = signature_from_hex(encoded).map_err(|e| {
            warn!(
                party = me,
                sender = sender.get(),
                round,
                error = %e,
                "Dropping malformed signature share"
            );
            CoordinatorError::Crypto(CryptoError::MalformedShare(e.to_string()))
        })?;

        let mut session = self.session.lock();
        if round < session.round
            || (round == session.round && session.phase == RoundPhase::Recovered)
        {
            debug!(
                party = me,
                sender = sender.get(),
                round,
                "Ignoring late signature share"
            );
            return Ok(SignatureShareOutcome::Ignored);
        }

        if round > session.round || session.message.is_none() {
            if round - session.round > self.max_buffered_rounds {
                warn!(
                    party = me,
                    sender = sender.get(),
                    round,
                    current = session.round,
                    "Dropping signature share too far ahead"
                );
                return Err(CoordinatorError::RoundMismatch {
                    current: session.round,
                    got: round,
                });
            }
            let candidates = session
                .pending
                .entry(round)
                .or_default()
                .entry(sender)
                .or_default();
            if candidates.contains(&share) {
                return Ok(SignatureShareOutcome::Duplicate);
            }
            if candidates.len() >= MAX_PENDING_PER_SENDER {
                warn!(
                    party = me,
                    sender = sender.get(),
                    round,
                    "Too many unverified signature shares from sender"
                );
                return Ok(SignatureShareOutcome::Ignored);
            }
            candidates.push(share);
            debug!(
                party = me,
                sender = sender.get(),
                round,
                "Buffered early signature share"
            );
            return Ok(SignatureShareOutcome::Buffered);
        }

        let outcome = self.collect_share(&mut session, sender, &share)?;
        if outcome == SignatureShareOutcome::Accepted {
            self.try_recover(&mut session)?;
        }
        Ok(outcome)
    }

    /// Wait for the beacon of `round`.
    pub async fn wait_for_beacon(
        &self,
        round: Round,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<RoundBeacon, CoordinatorError> {
        let mut beacons = self.beacon_tx.subscribe();
        loop {
            let latest = beacons.borrow_and_update().clone();
            match latest {
                Some(beacon) if beacon.round == round => return Ok(beacon),
                Some(beacon) if beacon.round > round => {
                    return Err(CoordinatorError::RoundMismatch {
                        current: beacon.round,
                        got: round,
                    })
                }
                _ => {}
            }
            if *shutdown.borrow() {
                return Err(CoordinatorError::Cancelled);
            }

            tokio::select! {
                result = beacons.changed() => {
                    if result.is_err() {
                        return Err(CoordinatorError::Cancelled);
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        return Err(CoordinatorError::Cancelled);
                    }
                }
            }
        }
    }

    /// Sign the round message, self-accept, then replay buffered shares.
    fn start_signing(
        &self,
        session: &mut RoundSession,
        seed: RandomSeed,
    ) -> Result<Option<ProtocolMessage>, CoordinatorError> {
        let round = session.round;
        let message = round_message(round, seed);
        session.phase = RoundPhase::Signing;

        let own = self.signer.sign(self.secret.scalar(), &message);
        session.message = Some(message);
        session.phase = RoundPhase::CollectingShares;

        if let Err(e) = self.collect_share(session, self.identity.party, &own) {
            error!(
                party = self.identity.party.get(),
                round,
                error = %e,
                "Own signature share does not verify"
            );
        }

        if let Some(buffered) = session.pending.remove(&round) {
            for (sender, candidates) in buffered {
                // Rejections are logged by collect_share.
                for share in candidates {
                    if self.collect_share(session, sender, &share).is_ok() {
                        break;
                    }
                }
            }
        }
        info!(
            party = self.identity.party.get(),
            round,
            seed = seed.0,
            shares = session.shares.len(),
            "Signed round message"
        );

        self.try_recover(session)?;
        Ok(Some(ProtocolMessage::SignatureShare {
            epoch: self.identity.epoch,
            round,
            sender: self.identity.party,
            share: signature_to_hex(&own),
        }))
    }

    fn collect_share(
        &self,
        session: &mut RoundSession,
        sender: PartyId,
        share: &G1Affine,
    ) -> Result<SignatureShareOutcome, CoordinatorError> {
        if session.shares.contains_key(&sender) {
            debug!(
                party = self.identity.party.get(),
                sender = sender.get(),
                "Ignoring duplicate signature share"
            );
            return Ok(SignatureShareOutcome::Duplicate);
        }
        let Some(message) = session.message.as_deref() else {
            return Ok(SignatureShareOutcome::Ignored);
        };

        match self.signer.verify_decoded_share(share, sender, message) {
            Ok(()) => {
                session.shares.insert(sender, *share);
                debug!(
                    party = self.identity.party.get(),
                    sender = sender.get(),
                    round = session.round,
                    valid = session.shares.len(),
                    "Accepted signature share"
                );
                Ok(SignatureShareOutcome::Accepted)
            }
            Err(e) => {
                warn!(
                    party = self.identity.party.get(),
                    sender = sender.get(),
                    round = session.round,
                    error = %e,
                    "Rejected signature share"
                );
                Err(e.into())
            }
        }
    }

    fn try_recover(&self, session: &mut RoundSession) -> Result<(), CoordinatorError> {
        if session.phase != RoundPhase::CollectingShares
            || session.shares.len() < self.signer.threshold()
        {
            return Ok(());
        }
        let Some(message) = session.message.as_deref() else {
            return Ok(());
        };

        let signature = self.signer.recover(&session.shares)?;
        if let Err(e) = self.signer.verify_group_signature(&signature, message) {
            error!(
                party = self.identity.party.get(),
                round = session.round,
                error = %e,
                "Recovered signature does not verify"
            );
            return Err(e.into());
        }

        let beacon = derive_beacon(&signature);
        let published = RoundBeacon {
            round: session.round,
            signature: compress_g1(&signature),
            output: beacon.output,
            seed: beacon.seed,
        };
        session.phase = RoundPhase::Recovered;
        session.shares.clear();

        info!(
            party = self.identity.party.get(),
            round = session.round,
            seed = beacon.seed.0,
            "Recovered round beacon"
        );
        self.beacon_tx.send_replace(Some(published));
        Ok(())
    }

    fn broadcast(&self, message: &ProtocolMessage) {
        for peer in (0..self.identity.n as usize).filter_map(PartyId::from_index) {
            if peer != self.identity.party {
                send_message(self.network.as_ref(), peer, message);
            }
        }
    }
}
