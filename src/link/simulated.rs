//! In-memory link layer.
//!
//! A `SimulatedNetwork` is the shared "air": it knows which endpoints are in
//! range of each other and at what cost. Frames go through the wire codec on
//! every hop so the simulation exercises the same encoding a radio would.

use log::{debug, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{InboundHandler, LinkLayer, MeshProtocol};
use crate::error::MeshResult;
use crate::message::message_types::{Cost, Message, PeerId};

#[derive(Default)]
struct NetworkState {
    receivers: HashMap<PeerId, Option<InboundHandler>>,
    links: HashMap<PeerId, HashMap<PeerId, Cost>>,
}

/// Shared medium connecting simulated endpoints
#[derive(Clone, Default)]
pub struct SimulatedNetwork {
    state: Arc<RwLock<NetworkState>>,
    frames_sent: Arc<AtomicU64>,
    frames_dropped: Arc<AtomicU64>,
}

impl SimulatedNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the endpoint for `peer_id`. Fails for ids that cannot appear
    /// in a message id or would collide with the broadcast sentinel.
    pub fn attach(&self, peer_id: impl Into<String>) -> MeshResult<Arc<SimulatedLink>> {
        let peer_id = PeerId::new(peer_id)?;
        self.state.write().receivers.entry(peer_id.clone()).or_insert(None);
        Ok(Arc::new(SimulatedLink {
            local_id: peer_id,
            network: self.clone(),
        }))
    }

    /// Bring two endpoints into range with cost 1
    pub fn connect(&self, a: &PeerId, b: &PeerId) {
        self.connect_with_cost(a, b, 1);
    }

    pub fn connect_with_cost(&self, a: &PeerId, b: &PeerId, cost: Cost) {
        if a == b {
            return;
        }
        let mut state = self.state.write();
        state.links.entry(a.clone()).or_default().insert(b.clone(), cost);
        state.links.entry(b.clone()).or_default().insert(a.clone(), cost);
        debug!("Simulated link {} <-> {} (cost {})", a, b, cost);
    }

    /// Take two endpoints out of range
    pub fn disconnect(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.state.write();
        if let Some(links) = state.links.get_mut(a) {
            links.remove(b);
        }
        if let Some(links) = state.links.get_mut(b) {
            links.remove(a);
        }
        debug!("Simulated link {} <-> {} removed", a, b);
    }

    pub fn is_linked(&self, a: &PeerId, b: &PeerId) -> bool {
        self.state
            .read()
            .links
            .get(a)
            .map(|links| links.contains_key(b))
            .unwrap_or(false)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    fn in_range(&self, from: &PeerId) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .state
            .read()
            .links
            .get(from)
            .map(|links| links.keys().cloned().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    fn cost(&self, a: &PeerId, b: &PeerId) -> Option<Cost> {
        self.state.read().links.get(a).and_then(|links| links.get(b).copied())
    }

    fn deliver(&self, from: &PeerId, to: &PeerId, message: &Message) -> bool {
        // Handler is cloned out so it runs without the network lock held
        let handler = {
            let state = self.state.read();
            let linked = state
                .links
                .get(from)
                .map(|links| links.contains_key(to))
                .unwrap_or(false);
            match state.receivers.get(to) {
                Some(Some(handler)) if linked => handler.clone(),
                _ => {
                    self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
            }
        };

        let frame = match MeshProtocol::encode(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode frame for {}: {}", to, e);
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };
        let decoded = match MeshProtocol::decode(&frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Failed to decode frame from {}: {}", from, e);
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };

        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        handler(decoded, from.clone());
        true
    }
}

/// One endpoint of a `SimulatedNetwork`
pub struct SimulatedLink {
    local_id: PeerId,
    network: SimulatedNetwork,
}

impl LinkLayer for SimulatedLink {
    fn local_id(&self) -> PeerId {
        self.local_id.clone()
    }

    fn send(&self, to: &PeerId, message: &Message) -> bool {
        self.network.deliver(&self.local_id, to, message)
    }

    fn broadcast(&self, message: &Message) -> usize {
        self.network
            .in_range(&self.local_id)
            .iter()
            .filter(|peer_id| self.network.deliver(&self.local_id, peer_id, message))
            .count()
    }

    fn link_cost(&self, peer: &PeerId) -> Cost {
        self.network.cost(&self.local_id, peer).unwrap_or(1)
    }

    fn on_receive(&self, handler: InboundHandler) {
        self.network
            .state
            .write()
            .receivers
            .insert(self.local_id.clone(), Some(handler));
    }

    fn clear_receiver(&self) {
        if let Some(slot) = self.network.state.write().receivers.get_mut(&self.local_id) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::message_types::{Destination, MessageId};
    use parking_lot::Mutex;

    fn text(from: &str, to: &str) -> Message {
        Message::text(
            MessageId::new(PeerId::from(from), 1),
            PeerId::from(from),
            Destination::Peer(PeerId::from(to)),
            3,
            "ping",
        )
    }

    fn recorder(link: &SimulatedLink) -> Arc<Mutex<Vec<(Message, PeerId)>>> {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        link.on_receive(Arc::new(move |message: Message, from: PeerId| {
            sink.lock().push((message, from))
        }));
        received
    }

    #[test]
    fn delivers_only_over_existing_links() {
        let network = SimulatedNetwork::new();
        let a = network.attach("a").unwrap();
        let b = network.attach("b").unwrap();
        let received = recorder(&b);

        assert!(!a.send(&PeerId::from("b"), &text("a", "b")));

        network.connect(&PeerId::from("a"), &PeerId::from("b"));
        assert!(a.send(&PeerId::from("b"), &text("a", "b")));
        assert_eq!(received.lock().len(), 1);
        assert_eq!(received.lock()[0].1, PeerId::from("a"));
        assert_eq!(received.lock()[0].0.text_content().as_deref(), Some("ping"));

        network.disconnect(&PeerId::from("a"), &PeerId::from("b"));
        assert!(!a.send(&PeerId::from("b"), &text("a", "b")));
        assert_eq!(network.frames_dropped(), 2);
    }

    #[test]
    fn refuses_frames_without_receiver() {
        let network = SimulatedNetwork::new();
        let a = network.attach("a").unwrap();
        let b = network.attach("b").unwrap();
        network.connect(&PeerId::from("a"), &PeerId::from("b"));

        assert!(!a.send(&PeerId::from("b"), &text("a", "b")));
        let received = recorder(&b);
        assert!(a.send(&PeerId::from("b"), &text("a", "b")));
        b.clear_receiver();
        assert!(!a.send(&PeerId::from("b"), &text("a", "b")));
        assert_eq!(received.lock().len(), 1);
    }

    #[test]
    fn attach_rejects_unroutable_ids() {
        let network = SimulatedNetwork::new();
        for bad in ["", "*", "node#1"] {
            assert!(network.attach(bad).is_err(), "{:?} was accepted", bad);
        }
        assert_eq!(network.attach("node-1").unwrap().local_id(), PeerId::from("node-1"));
    }

    #[test]
    fn broadcast_reaches_peers_in_range() {
        let network = SimulatedNetwork::new();
        let a = network.attach("a").unwrap();
        let b = network.attach("b").unwrap();
        let c = network.attach("c").unwrap();
        let _d = network.attach("d").unwrap();
        let (rb, rc) = (recorder(&b), recorder(&c));
        network.connect(&PeerId::from("a"), &PeerId::from("b"));
        network.connect_with_cost(&PeerId::from("a"), &PeerId::from("c"), 4);

        assert_eq!(a.broadcast(&text("a", "b")), 2);
        assert_eq!(rb.lock().len() + rc.lock().len(), 2);
        assert_eq!(a.link_cost(&PeerId::from("c")), 4);
        assert_eq!(network.frames_sent(), 2);
    }
}
