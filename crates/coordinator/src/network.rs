//! Outbound transport seam.
//!
//! The coordinators only ever call [`PeerNetwork::send`], once per peer per
//! broadcast, and never wait for delivery. Connection management and framing
//! belong to whatever implements the trait.
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`InMemoryNetwork`] | Process-local mesh used by the simulator and tests |
//! | [`NetworkEndpoint`] | One party's sending handle into an [`InMemoryNetwork`] |
//! | [`RecordingNetwork`] | Outbox that only records, for unit tests |

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use beacon_types::{PartyId, ProtocolMessage};

/// Fire-and-forget delivery to a single peer.
pub trait PeerNetwork: Send + Sync {
    fn send(&self, peer: PartyId, payload: Vec<u8>);
}

/// Encode `message` and hand it to the network, logging encoder failures.
pub(crate) fn send_message(network: &dyn PeerNetwork, peer: PartyId, message: &ProtocolMessage) {
    match message.encode() {
        Ok(payload) => network.send(peer, payload),
        Err(e) => tracing::error!(peer = peer.get(), error = %e, "Failed to encode message"),
    }
}

pub type Inbox = mpsc::UnboundedReceiver<Vec<u8>>;

#[derive(Default)]
struct Mesh {
    inboxes: RwLock<HashMap<PartyId, mpsc::UnboundedSender<Vec<u8>>>>,
    silenced: RwLock<HashSet<PartyId>>,
    duplicate: AtomicBool,
    delivered: AtomicUsize,
    dropped: AtomicUsize,
}

/// In-process network connecting any number of parties.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    mesh: Arc<Mesh>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the inbox of `party`. Re-registering replaces the old inbox.
    pub fn register(&self, party: PartyId) -> Inbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.mesh.inboxes.write().insert(party, tx);
        rx
    }

    /// Sending handle for `party`.
    pub fn endpoint(&self, party: PartyId) -> NetworkEndpoint {
        NetworkEndpoint {
            mesh: self.mesh.clone(),
            me: party,
        }
    }

    /// Drop every message `party` sends from now on.
    pub fn silence(&self, party: PartyId) {
        self.mesh.silenced.write().insert(party);
    }

    pub fn unsilence(&self, party: PartyId) {
        self.mesh.silenced.write().remove(&party);
    }

    /// Deliver every message twice.
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.mesh.duplicate.store(enabled, Ordering::SeqCst);
    }

    pub fn delivered_count(&self) -> usize {
        self.mesh.delivered.load(Ordering::SeqCst)
    }

    pub fn dropped_count(&self) -> usize {
        self.mesh.dropped.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for InMemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryNetwork")
            .field("parties", &self.mesh.inboxes.read().len())
            .field("delivered", &self.delivered_count())
            .field("dropped", &self.dropped_count())
            .finish()
    }
}

/// One party's view of an [`InMemoryNetwork`].
#[derive(Clone)]
pub struct NetworkEndpoint {
    mesh: Arc<Mesh>,
    me: PartyId,
}

impl NetworkEndpoint {
    pub fn party(&self) -> PartyId {
        self.me
    }
}

impl PeerNetwork for NetworkEndpoint {
    fn send(&self, peer: PartyId, payload: Vec<u8>) {
        if self.mesh.silenced.read().contains(&self.me) {
            self.mesh.dropped.fetch_add(1, Ordering::SeqCst);
            trace!(from = self.me.get(), to = peer.get(), "Dropped message from silenced party");
            return;
        }

        let inboxes = self.mesh.inboxes.read();
        let Some(inbox) = inboxes.get(&peer) else {
            self.mesh.dropped.fetch_add(1, Ordering::SeqCst);
            debug!(from = self.me.get(), to = peer.get(), "No inbox registered for peer");
            return;
        };

        let copies = if self.mesh.duplicate.load(Ordering::SeqCst) { 2 } else { 1 };
        for _ in 0..copies {
            if inbox.send(payload.clone()).is_ok() {
                self.mesh.delivered.fetch_add(1, Ordering::SeqCst);
            } else {
                self.mesh.dropped.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

/// Records outbound payloads instead of delivering them.
#[derive(Default)]
pub struct RecordingNetwork {
    outbox: Mutex<Vec<(PartyId, Vec<u8>)>>,
}

impl RecordingNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every recorded message, decoding the envelopes.
    pub fn drain_outbox(&self) -> Vec<(PartyId, ProtocolMessage)> {
        std::mem::take(&mut *self.outbox.lock())
            .into_iter()
            .filter_map(|(peer, payload)| {
                ProtocolMessage::decode(&payload)
                    .ok()
                    .map(|message| (peer, message))
            })
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.outbox.lock().len()
    }
}

impl PeerNetwork for RecordingNetwork {
    fn send(&self, peer: PartyId, payload: Vec<u8>) {
        self.outbox.lock().push((peer, payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn party(i: u32) -> PartyId {
        PartyId::new(i).unwrap()
    }

    #[test]
    fn test_delivery_and_silence() {
        let network = InMemoryNetwork::new();
        let mut inbox = network.register(party(2));
        let sender = network.endpoint(party(1));

        sender.send(party(2), vec![1, 2, 3]);
        assert_eq!(inbox.try_recv().unwrap(), vec![1, 2, 3]);

        network.silence(party(1));
        sender.send(party(2), vec![4]);
        assert!(inbox.try_recv().is_err());
        assert_eq!(network.dropped_count(), 1);

        network.unsilence(party(1));
        sender.send(party(3), vec![5]);
        assert_eq!(network.dropped_count(), 2);
    }

    #[test]
    fn test_duplicate_delivery() {
        let network = InMemoryNetwork::new();
        let mut inbox = network.register(party(1));
        network.set_duplicate_delivery(true);

        network.endpoint(party(2)).send(party(1), vec![9]);
        assert_eq!(inbox.try_recv().unwrap(), vec![9]);
        assert_eq!(inbox.try_recv().unwrap(), vec![9]);
        assert_eq!(network.delivered_count(), 2);
    }

    #[test]
    fn test_recording_network() {
        let network = RecordingNetwork::new();
        let message = ProtocolMessage::ShareAck {
            epoch: 1,
            sender: party(1),
        };
        send_message(&network, party(2), &message);
        network.send(party(3), vec![0xff]);

        assert_eq!(network.sent_count(), 2);
        // Undecodable payloads are skipped.
        assert_eq!(network.drain_outbox(), vec![(party(2), message)]);
        assert_eq!(network.sent_count(), 0);
    }
}
