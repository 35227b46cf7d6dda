//! Inbound message dispatch.
//!
//! Decodes envelopes off the wire and hands them to the coordinator that
//! owns them. Signature shares that arrive before the round coordinator
//! exists (our DKG is still running) are held and replayed on attach. DKG
//! traffic for a node restored from a checkpoint has no owner and is dropped.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use beacon_crypto::bls::signature_from_hex;
use beacon_crypto::CryptoError;
use beacon_types::{PartyId, ProtocolMessage};

use crate::error::CoordinatorError;
use crate::network::Inbox;
use crate::round_signing::RoundSignatureCoordinator;
use crate::share_exchange::ShareExchangeCoordinator;

/// Early signature shares held per sender until the round coordinator exists.
const MAX_EARLY_SHARES_PER_SENDER: usize = 16;

/// Early signature shares, keyed by sender so one peer cannot crowd out the rest.
type EarlyShares = BTreeMap<PartyId, Vec<ProtocolMessage>>;

pub struct MessageRouter {
    me: PartyId,
    /// Number of participants in the epoch
    n: u32,
    shares: RwLock<Option<Arc<ShareExchangeCoordinator>>>,
    rounds: RwLock<Option<Arc<RoundSignatureCoordinator>>>,
    early: Mutex<EarlyShares>,
}

impl MessageRouter {
    pub fn new(me: PartyId, n: u32) -> Self {
        Self {
            me,
            n,
            shares: RwLock::new(None),
            rounds: RwLock::new(None),
            early: Mutex::new(BTreeMap::new()),
        }
    }

    /// Router for a node that starts with a DKG.
    pub fn with_shares(shares: Arc<ShareExchangeCoordinator>) -> Self {
        let router = Self::new(shares.party(), shares.participants());
        router.attach_shares(shares);
        router
    }

    pub fn attach_shares(&self, shares: Arc<ShareExchangeCoordinator>) {
        *self.shares.write() = Some(shares);
    }

    /// Start routing signature shares to `rounds`, replaying any held back.
    pub fn attach_rounds(&self, rounds: Arc<RoundSignatureCoordinator>) {
        let early: Vec<ProtocolMessage> = {
            let mut early = self.early.lock();
            *self.rounds.write() = Some(rounds);
            std::mem::take(&mut *early).into_values().flatten().collect()
        };
        if !early.is_empty() {
            debug!(
                party = self.me.get(),
                count = early.len(),
                "Replaying early signature shares"
            );
        }
        for message in early {
            // Outcomes are logged by the coordinator.
            let _ = self.dispatch(message);
        }
    }

    /// Decode and dispatch one payload.
    pub fn handle(&self, payload: &[u8]) -> Result<(), CoordinatorError> {
        let message = ProtocolMessage::decode(payload).map_err(|e| {
            warn!(party = self.me.get(), error = %e, "Dropping undecodable message");
            e
        })?;
        self.dispatch(message)
    }

    fn dispatch(&self, message: ProtocolMessage) -> Result<(), CoordinatorError> {
        match message {
            ProtocolMessage::SecretShare {
                epoch,
                sender,
                share,
            } => match self.share_coordinator(sender) {
                Some(shares) => shares.on_share_received(epoch, sender, &share).map(|_| ()),
                None => Ok(()),
            },
            ProtocolMessage::ShareAck { epoch, sender } => match self.share_coordinator(sender) {
                Some(shares) => shares.on_ack_received(epoch, sender),
                None => Ok(()),
            },
            ProtocolMessage::SignatureShare {
                epoch,
                round,
                sender,
                share,
            } => {
                let rounds = {
                    let mut early = self.early.lock();
                    let Some(rounds) = self.rounds.read().clone() else {
                        let message = ProtocolMessage::SignatureShare {
                            epoch,
                            round,
                            sender,
                            share,
                        };
                        return self.hold(&mut early, message);
                    };
                    rounds
                };
                rounds
                    .on_signature_share_received(epoch, round, sender, &share)
                    .map(|_| ())
            }
        }
    }

    fn share_coordinator(&self, sender: PartyId) -> Option<Arc<ShareExchangeCoordinator>> {
        let shares = self.shares.read().clone();
        if shares.is_none() {
            debug!(
                party = self.me.get(),
                sender = sender.get(),
                "No share exchange running, dropping DKG message"
            );
        }
        shares
    }

    /// Keep a signature share until the round coordinator is attached.
    ///
    /// Only well-formed shares from other roster members are held, at most
    /// `MAX_EARLY_SHARES_PER_SENDER` each.
    fn hold(
        &self,
        early: &mut EarlyShares,
        message: ProtocolMessage,
    ) -> Result<(), CoordinatorError> {
        let ProtocolMessage::SignatureShare { sender, share, .. } = &message else {
            return Ok(());
        };
        let sender = *sender;
        if sender == self.me {
            warn!(
                party = self.me.get(),
                "Dropping signature share that claims to come from us"
            );
            return Err(CoordinatorError::SelfAddressed(sender.get()));
        }
        if sender.get() > self.n {
            warn!(
                party = self.me.get(),
                sender = sender.get(),
                "Dropping early signature share from unknown party"
            );
            return Err(CoordinatorError::UnknownParty(sender.get()));
        }
        if let Err(e) = signature_from_hex(share) {
            warn!(
                party = self.me.get(),
                sender = sender.get(),
                error = %e,
                "Dropping malformed early signature share"
            );
            return Err(CryptoError::MalformedShare(e.to_string()).into());
        }

        let held = early.entry(sender).or_default();
        if held.contains(&message) {
            return Ok(());
        }
        if held.len() >= MAX_EARLY_SHARES_PER_SENDER {
            warn!(
                party = self.me.get(),
                sender = sender.get(),
                "Early signature share buffer full for sender"
            );
            return Ok(());
        }
        held.push(message);
        Ok(())
    }

    /// Drain `inbox` until it closes or `shutdown` fires.
    pub async fn run(&self, mut inbox: Inbox, mut shutdown: watch::Receiver<bool>) {
        if *shutdown.borrow() {
            return;
        }
        info!(party = self.me.get(), "Message router started");

        loop {
            tokio::select! {
                payload = inbox.recv() => {
                    match payload {
                        Some(payload) => {
                            if let Err(e) = self.handle(&payload) {
                                debug!(
                                    party = self.me.get(),
                                    error = %e,
                                    "Inbound message dropped"
                                );
                            }
                        }
                        None => break,
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(party = self.me.get(), "Message router stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::RecordingNetwork;
    use crate::share_exchange::ExchangePhase;
    use beacon_crypto::bls::signature_to_hex;
    use beacon_crypto::threshold::sign_share;
    use beacon_dkg::{DkgConfig, DkgEngine};
    use beacon_types::Round;
    use bls12_381::Scalar;
    use rand::rngs::OsRng;

    fn party(i: u32) -> PartyId {
        PartyId::new(i).unwrap()
    }

    fn router() -> (MessageRouter, Arc<ShareExchangeCoordinator>, Arc<RecordingNetwork>) {
        let config = DkgConfig::new(2, 1, 1).unwrap();
        let engine = DkgEngine::initialize(config, party(1), &mut OsRng).unwrap();
        let network = Arc::new(RecordingNetwork::new());
        let shares = Arc::new(ShareExchangeCoordinator::new(engine, network.clone()));
        (MessageRouter::with_shares(shares.clone()), shares, network)
    }

    #[test]
    fn test_routes_secret_share_and_ack() {
        let (router, shares, network) = router();
        shares.start().unwrap();
        network.drain_outbox();

        let ack = ProtocolMessage::ShareAck {
            epoch: 1,
            sender: party(2),
        };
        router.handle(&ack.encode().unwrap()).unwrap();
        assert!(shares.unacknowledged().is_empty());

        let share = ProtocolMessage::SecretShare {
            epoch: 1,
            sender: party(2),
            share: "17".to_string(),
        };
        router.handle(&share.encode().unwrap()).unwrap();
        assert_eq!(shares.phase(), ExchangePhase::Aggregated);
        assert!(shares.is_settled());
    }

    #[test]
    fn test_garbage_is_dropped() {
        let (router, shares, _) = router();
        assert!(matches!(
            router.handle(&[0xde, 0xad]),
            Err(CoordinatorError::Encoding(_))
        ));
        assert_eq!(shares.phase(), ExchangePhase::Idle);
    }

    fn signature_share(sender: u32, round: Round, share: String) -> ProtocolMessage {
        ProtocolMessage::SignatureShare {
            epoch: 1,
            round,
            sender: party(sender),
            share,
        }
    }

    fn well_formed(seed: u64) -> String {
        signature_to_hex(&sign_share(&Scalar::from(seed + 1), b"early"))
    }

    #[test]
    fn test_signature_shares_held_until_attach() {
        let (router, _, _) = router();
        let message = signature_share(2, 1, well_formed(0));
        router.handle(&message.encode().unwrap()).unwrap();
        router.handle(&message.encode().unwrap()).unwrap();
        assert_eq!(router.early.lock()[&party(2)].len(), 1);
    }

    #[test]
    fn test_early_shares_are_checked_before_holding() {
        let config = DkgConfig::new(3, 2, 1).unwrap();
        let engine = DkgEngine::initialize(config, party(1), &mut OsRng).unwrap();
        let shares = Arc::new(ShareExchangeCoordinator::new(
            engine,
            Arc::new(RecordingNetwork::new()),
        ));
        let router = MessageRouter::with_shares(shares);

        let garbage = signature_share(2, 1, "00".repeat(48));
        assert!(matches!(
            router.handle(&garbage.encode().unwrap()),
            Err(CoordinatorError::Crypto(CryptoError::MalformedShare(_)))
        ));
        let outsider = signature_share(4, 1, well_formed(0));
        assert!(matches!(
            router.handle(&outsider.encode().unwrap()),
            Err(CoordinatorError::UnknownParty(4))
        ));
        let impostor = signature_share(1, 1, well_formed(0));
        assert!(matches!(
            router.handle(&impostor.encode().unwrap()),
            Err(CoordinatorError::SelfAddressed(1))
        ));
        assert!(router.early.lock().is_empty());
    }

    #[test]
    fn test_flooding_sender_cannot_crowd_out_others() {
        let config = DkgConfig::new(3, 2, 1).unwrap();
        let engine = DkgEngine::initialize(config, party(1), &mut OsRng).unwrap();
        let shares = Arc::new(ShareExchangeCoordinator::new(
            engine,
            Arc::new(RecordingNetwork::new()),
        ));
        let router = MessageRouter::with_shares(shares);

        for i in 0..100u64 {
            let junk = signature_share(2, i + 1, well_formed(i));
            router.handle(&junk.encode().unwrap()).unwrap();
        }
        let honest = signature_share(3, 1, well_formed(500));
        router.handle(&honest.encode().unwrap()).unwrap();

        let early = router.early.lock();
        assert_eq!(early[&party(2)].len(), MAX_EARLY_SHARES_PER_SENDER);
        assert_eq!(early[&party(3)], vec![honest]);
    }

    #[test]
    fn test_dkg_traffic_without_exchange_is_dropped() {
        let router = MessageRouter::new(party(1), 2);
        let ack = ProtocolMessage::ShareAck {
            epoch: 1,
            sender: party(2),
        };
        router.handle(&ack.encode().unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (router, _, _) = router();
        let (_tx, inbox) = tokio::sync::mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let run = router.run(inbox, shutdown_rx);
        let stop = async {
            shutdown_tx.send(true).unwrap();
        };
        tokio::join!(run, stop);
    }
}
