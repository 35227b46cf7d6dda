//! DKG share exchange.
//!
//! Drives one [`DkgEngine`] through an epoch:
//!
//! 1. `start` computes a share for every participant, self-accepts its own
//!    and broadcasts the rest (`Idle -> SharesComputed -> Exchanging`)
//! 2. Inbound shares are accepted, deduplicated and acknowledged
//! 3. Once all N shares are in, the engine aggregates (`Aggregated`) and the
//!    group secret share is published on a watch channel
//!
//! Shares that are not acknowledged are resent by `run_retransmission` until
//! every peer has acknowledged or the caller cancels.
//!
//! All session state sits behind a single lock that is never held across an
//! `.await`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use beacon_crypto::bls::scalar_to_decimal;
use beacon_dkg::{DkgEngine, GroupSecretShare, ShareOutcome, VerificationVector};
use beacon_types::{EpochId, PartyId, ProtocolMessage};

use crate::error::CoordinatorError;
use crate::network::{send_message, PeerNetwork};

/// Phase of the share exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangePhase {
    Idle,
    SharesComputed,
    Exchanging,
    Aggregated,
}

struct ExchangeSession {
    phase: ExchangePhase,
    engine: DkgEngine,
    /// Decimal-encoded shares owed to each peer
    outgoing: BTreeMap<PartyId, String>,
    acked: BTreeSet<PartyId>,
}

/// Per-epoch share exchange state machine.
pub struct ShareExchangeCoordinator {
    me: PartyId,
    epoch: EpochId,
    n: u32,
    network: Arc<dyn PeerNetwork>,
    session: Mutex<ExchangeSession>,
    phase_tx: watch::Sender<ExchangePhase>,
    share_tx: watch::Sender<Option<GroupSecretShare>>,
}

impl ShareExchangeCoordinator {
    pub fn new(engine: DkgEngine, network: Arc<dyn PeerNetwork>) -> Self {
        let (phase_tx, _) = watch::channel(ExchangePhase::Idle);
        let (share_tx, _) = watch::channel(None);
        Self {
            me: engine.party(),
            epoch: engine.epoch(),
            n: engine.config().n,
            network,
            session: Mutex::new(ExchangeSession {
                phase: ExchangePhase::Idle,
                engine,
                outgoing: BTreeMap::new(),
                acked: BTreeSet::new(),
            }),
            phase_tx,
            share_tx,
        }
    }

    pub fn party(&self) -> PartyId {
        self.me
    }

    /// Number of participants in the epoch.
    pub fn participants(&self) -> u32 {
        self.n
    }

    pub fn epoch(&self) -> EpochId {
        self.epoch
    }

    pub fn phase(&self) -> ExchangePhase {
        self.session.lock().phase
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<ExchangePhase> {
        self.phase_tx.subscribe()
    }

    /// Our verification vector, for out-of-band publication.
    pub fn publish_vvec(&self) -> VerificationVector {
        self.session.lock().engine.publish_vvec()
    }

    /// Register a peer's verification vector so its share is Feldman-checked.
    pub fn register_peer_vvec(
        &self,
        sender: PartyId,
        vvec: &VerificationVector,
    ) -> Result<(), CoordinatorError> {
        self.session.lock().engine.register_peer_vvec(sender, vvec)?;
        Ok(())
    }

    pub fn group_secret_share(&self) -> Option<GroupSecretShare> {
        self.share_tx.borrow().clone()
    }

    /// Compute every share, self-accept ours and broadcast the rest.
    ///
    /// Calling it again after the exchange has started does nothing.
    pub fn start(&self) -> Result<(), CoordinatorError> {
        let outgoing = {
            let mut session = self.session.lock();
            if session.phase != ExchangePhase::Idle {
                debug!(party = self.me.get(), "Share exchange already started");
                return Ok(());
            }

            let shares = session.engine.compute_all_shares()?;
            self.set_phase(&mut session, ExchangePhase::SharesComputed);

            for (party, share) in shares {
                if party == self.me {
                    session.engine.accept_share(party, share)?;
                } else {
                    session.outgoing.insert(party, scalar_to_decimal(&share));
                }
            }
            self.set_phase(&mut session, ExchangePhase::Exchanging);
            info!(
                party = self.me.get(),
                epoch = self.epoch,
                peers = session.outgoing.len(),
                "Broadcasting DKG shares"
            );

            self.try_aggregate(&mut session)?;
            session.outgoing.clone()
        };

        for (peer, share) in outgoing {
            self.send_share(peer, share);
        }
        Ok(())
    }

    /// Handle a `SecretShare` message. Every stored or duplicate share is acknowledged.
    pub fn on_share_received(
        &self,
        epoch: EpochId,
        sender: PartyId,
        encoded: &str,
    ) -> Result<ShareOutcome, CoordinatorError> {
        self.check_epoch(epoch)?;
        if sender == self.me {
            warn!(party = self.me.get(), "Dropping share that claims to come from us");
            return Err(CoordinatorError::SelfAddressed(sender.get()));
        }

        let outcome = {
            let mut session = self.session.lock();
            let outcome = session.engine.accept_encoded_share(sender, encoded)?;
            if session.phase == ExchangePhase::Exchanging {
                self.try_aggregate(&mut session)?;
            }
            outcome
        };

        send_message(
            self.network.as_ref(),
            sender,
            &ProtocolMessage::ShareAck {
                epoch: self.epoch,
                sender: self.me,
            },
        );
        Ok(outcome)
    }

    /// Handle a `ShareAck` from `sender`.
    pub fn on_ack_received(&self, epoch: EpochId, sender: PartyId) -> Result<(), CoordinatorError> {
        self.check_epoch(epoch)?;
        if sender == self.me {
            warn!(party = self.me.get(), "Dropping ack that claims to come from us");
            return Err(CoordinatorError::SelfAddressed(sender.get()));
        }
        if sender.get() > self.n {
            warn!(
                party = self.me.get(),
                sender = sender.get(),
                "Dropping ack from unknown party"
            );
            return Err(CoordinatorError::UnknownParty(sender.get()));
        }
        if self.session.lock().acked.insert(sender) {
            debug!(party = self.me.get(), sender = sender.get(), "Share acknowledged");
        }
        Ok(())
    }

    /// Peers that have not yet acknowledged our share.
    pub fn unacknowledged(&self) -> Vec<PartyId> {
        let session = self.session.lock();
        session
            .outgoing
            .keys()
            .filter(|peer| !session.acked.contains(peer))
            .copied()
            .collect()
    }

    /// Aggregated and acknowledged by every peer.
    pub fn is_settled(&self) -> bool {
        let session = self.session.lock();
        session.phase == ExchangePhase::Aggregated
            && session.outgoing.keys().all(|peer| session.acked.contains(peer))
    }

    /// Resend our share to every unacknowledged peer. Returns how many were sent.
    pub fn retransmit_pending(&self) -> usize {
        let pending: Vec<(PartyId, String)> = {
            let session = self.session.lock();
            if matches!(session.phase, ExchangePhase::Idle | ExchangePhase::SharesComputed) {
                return 0;
            }
            session
                .outgoing
                .iter()
                .filter(|(peer, _)| !session.acked.contains(peer))
                .map(|(peer, share)| (*peer, share.clone()))
                .collect()
        };

        let count = pending.len();
        for (peer, share) in pending {
            self.send_share(peer, share);
        }
        count
    }

    /// Periodically resend unacknowledged shares.
    ///
    /// Runs until the exchange is settled or `shutdown` flips to `true`.
    pub async fn run_retransmission(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if *shutdown.borrow() {
            return;
        }
        debug!(party = self.me.get(), ?interval, "Share retransmission started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        debug!(party = self.me.get(), "Share retransmission cancelled");
                        return;
                    }
                    continue;
                }
            }

            if self.is_settled() {
                debug!(party = self.me.get(), "Share exchange settled");
                return;
            }
            let resent = self.retransmit_pending();
            if resent > 0 {
                debug!(party = self.me.get(), resent, "Retransmitted DKG shares");
            }
        }
    }

    /// Wait until our group secret share is available.
    pub async fn wait_for_group_share(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<GroupSecretShare, CoordinatorError> {
        let mut shares = self.share_tx.subscribe();
        loop {
            if let Some(share) = shares.borrow_and_update().clone() {
                return Ok(share);
            }
            if *shutdown.borrow() {
                return Err(CoordinatorError::Cancelled);
            }

            tokio::select! {
                result = shares.changed() => {
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

    fn try_aggregate(&self, session: &mut ExchangeSession) -> Result<(), CoordinatorError> {
        if session.phase == ExchangePhase::Aggregated || !session.engine.is_complete() {
            return Ok(());
        }

        match session.engine.aggregate() {
            Ok(share) => {
                self.set_phase(session, ExchangePhase::Aggregated);
                self.share_tx.send_replace(Some(share));
                info!(party = self.me.get(), epoch = self.epoch, "DKG share exchange complete");
                Ok(())
            }
            Err(e) => {
                error!(party = self.me.get(), error = %e, "Aggregation failed");
                Err(e.into())
            }
        }
    }

    fn set_phase(&self, session: &mut ExchangeSession, phase: ExchangePhase) {
        session.phase = phase;
        self.phase_tx.send_replace(phase);
    }

    fn send_share(&self, peer: PartyId, share: String) {
        send_message(
            self.network.as_ref(),
            peer,
            &ProtocolMessage::SecretShare {
                epoch: self.epoch,
                sender: self.me,
                share,
            },
        );
    }

    fn check_epoch(&self, epoch: EpochId) -> Result<(), CoordinatorError> {
        if epoch != self.epoch {
            warn!(
                party = self.me.get(),
                expected = self.epoch,
                got = epoch,
                "Dropping message for another epoch"
            );
            return Err(CoordinatorError::EpochMismatch {
                expected: self.epoch,
                got: epoch,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::RecordingNetwork;
    use beacon_dkg::DkgConfig;
    use rand::rngs::OsRng;

    fn party(i: u32) -> PartyId {
        PartyId::new(i).unwrap()
    }

    fn coordinator(n: u32, t: u32, me: u32) -> (ShareExchangeCoordinator, Arc<RecordingNetwork>) {
        let config = DkgConfig::new(n, t, 3).unwrap();
        let engine = DkgEngine::initialize(config, party(me), &mut OsRng).unwrap();
        let network = Arc::new(RecordingNetwork::new());
        (ShareExchangeCoordinator::new(engine, network.clone()), network)
    }

    fn share_for(from: &ShareExchangeCoordinator, to: PartyId) -> String {
        let share = from.session.lock().engine.share_for(to).unwrap();
        scalar_to_decimal(&share)
    }

    #[test]
    fn test_start_broadcasts_to_peers() {
        let (coordinator, network) = coordinator(3, 2, 1);
        assert_eq!(coordinator.phase(), ExchangePhase::Idle);

        coordinator.start().unwrap();
        assert_eq!(coordinator.phase(), ExchangePhase::Exchanging);

        let sent = network.drain_outbox();
        let peers: Vec<u32> = sent.iter().map(|(peer, _)| peer.get()).collect();
        assert_eq!(peers, vec![2, 3]);
        assert!(sent
            .iter()
            .all(|(_, m)| matches!(m, ProtocolMessage::SecretShare { epoch: 3, .. })));

        // Second start is a no-op.
        coordinator.start().unwrap();
        assert_eq!(network.sent_count(), 0);
    }

    #[test]
    fn test_single_party_aggregates_on_start() {
        let (coordinator, network) = coordinator(1, 1, 1);
        coordinator.start().unwrap();
        assert_eq!(coordinator.phase(), ExchangePhase::Aggregated);
        assert!(coordinator.group_secret_share().is_some());
        assert!(coordinator.is_settled());
        assert_eq!(network.sent_count(), 0);
    }

    #[test]
    fn test_exchange_completes_and_acks() {
        let (alice, alice_net) = coordinator(2, 2, 1);
        let (bob, _) = coordinator(2, 2, 2);
        alice.start().unwrap();
        alice_net.drain_outbox();

        let outcome = alice.on_share_received(3, party(2), &share_for(&bob, party(1))).unwrap();
        assert_eq!(outcome, ShareOutcome::Accepted);
        assert_eq!(alice.phase(), ExchangePhase::Aggregated);
        assert!(alice.group_secret_share().is_some());

        let acks = alice_net.drain_outbox();
        assert_eq!(
            acks,
            vec![(party(2), ProtocolMessage::ShareAck { epoch: 3, sender: party(1) })]
        );
    }

    #[test]
    fn test_duplicate_share_is_acked_but_not_stored() {
        let (alice, alice_net) = coordinator(3, 2, 1);
        let (bob, _) = coordinator(3, 2, 2);
        alice.start().unwrap();
        alice_net.drain_outbox();

        let share = share_for(&bob, party(1));
        alice.on_share_received(3, party(2), &share).unwrap();
        assert_eq!(
            alice.on_share_received(3, party(2), &share).unwrap(),
            ShareOutcome::Duplicate
        );
        assert_eq!(alice.session.lock().engine.received_count(), 2);
        assert_eq!(alice_net.drain_outbox().len(), 2);
    }

    #[test]
    fn test_malformed_share_is_dropped() {
        let (alice, alice_net) = coordinator(3, 2, 1);
        alice.start().unwrap();
        alice_net.drain_outbox();

        assert!(alice.on_share_received(3, party(2), "not-a-number").is_err());
        assert!(matches!(
            alice.on_share_received(9, party(2), "1"),
            Err(CoordinatorError::EpochMismatch { expected: 3, got: 9 })
        ));
        assert_eq!(alice.phase(), ExchangePhase::Exchanging);
        assert_eq!(alice_net.sent_count(), 0);
    }

    #[test]
    fn test_messages_claiming_our_id_are_rejected() {
        let (alice, alice_net) = coordinator(3, 2, 1);
        alice.start().unwrap();
        alice_net.drain_outbox();

        assert!(matches!(
            alice.on_share_received(3, party(1), "5"),
            Err(CoordinatorError::SelfAddressed(1))
        ));
        assert!(matches!(
            alice.on_ack_received(3, party(1)),
            Err(CoordinatorError::SelfAddressed(1))
        ));
        assert!(matches!(
            alice.on_ack_received(3, party(4)),
            Err(CoordinatorError::UnknownParty(4))
        ));
        assert_eq!(alice.unacknowledged(), vec![party(2), party(3)]);
        assert_eq!(alice_net.sent_count(), 0);
    }

    #[test]
    fn test_retransmit_only_unacknowledged() {
        let (alice, alice_net) = coordinator(3, 2, 1);
        assert_eq!(alice.retransmit_pending(), 0);

        alice.start().unwrap();
        alice_net.drain_outbox();
        alice.on_ack_received(3, party(3)).unwrap();

        assert_eq!(alice.unacknowledged(), vec![party(2)]);
        assert_eq!(alice.retransmit_pending(), 1);
        let resent = alice_net.drain_outbox();
        assert_eq!(resent[0].0, party(2));

        assert!(alice.on_ack_received(3, party(4)).is_err());
    }

    #[tokio::test]
    async fn test_retransmission_stops_on_shutdown() {
        let (alice, alice_net) = coordinator(2, 2, 1);
        let alice = Arc::new(alice);
        alice.start().unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = {
            let alice = alice.clone();
            tokio::spawn(async move {
                alice
                    .run_retransmission(Duration::from_millis(5), shutdown_rx)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(40)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        // Initial broadcast plus at least one resend.
        assert!(alice_net.sent_count() >= 2);
    }

    #[tokio::test]
    async fn test_wait_for_group_share_cancelled() {
        let (alice, _) = coordinator(3, 2, 1);
        alice.start().unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let waiter = alice.wait_for_group_share(shutdown_rx);
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            shutdown_tx.send(true).unwrap();
        };
        let (result, _) = tokio::join!(waiter, cancel);
        assert!(matches!(result, Err(CoordinatorError::Cancelled)));
    }
}
