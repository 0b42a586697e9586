//! Message Dispatcher
//!
//! Classifies every inbound message by kind and runs the matching handler:
//! discovery, route updates, local delivery, unicast forwarding, flooding of
//! broadcasts and acknowledgment matching. Also originates outbound traffic
//! so locally sent and relayed messages follow the same TTL rules.
//!
//! All state sits behind short-lived synchronous locks. No lock is held while
//! a frame is handed to the link or a callback runs.

use dashmap::DashMap;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

use super::message_types::{
    Destination, DiscoveryPayload, Message, MessageId, MessageKind, PeerId, RouteAdvertisement,
    SystemNotice,
};
use super::reliability::ReliabilityTracker;
use super::routing_table::{RouteEntry, RoutingTable};
use super::seen_cache::{SeenCache, Sighting};
use crate::config::MeshConfig;
use crate::error::{MeshError, MeshResult};
use crate::link::LinkLayer;
use crate::mesh::events::MeshEvents;
use crate::mesh::peer_registry::{LivenessReport, PeerRegistry, PeerStatus};

/// Dispatch counters
#[derive(Debug, Default)]
pub struct DispatchStats {
    delivered: AtomicU64,
    forwarded: AtomicU64,
    duplicates: AtomicU64,
    ttl_exhausted: AtomicU64,
    no_route: AtomicU64,
    link_failures: AtomicU64,
    stale_advertisements: AtomicU64,
    retransmissions: AtomicU64,
    delivery_failures: AtomicU64,
}

/// Point-in-time copy of `DispatchStats`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchCounters {
    pub delivered: u64,
    pub forwarded: u64,
    pub duplicates: u64,
    pub ttl_exhausted: u64,
    pub no_route: u64,
    pub link_failures: u64,
    pub stale_advertisements: u64,
    pub retransmissions: u64,
    pub delivery_failures: u64,
}

impl DispatchStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchCounters {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        DispatchCounters {
            delivered: load(&self.delivered),
            forwarded: load(&self.forwarded),
            duplicates: load(&self.duplicates),
            ttl_exhausted: load(&self.ttl_exhausted),
            no_route: load(&self.no_route),
            link_failures: load(&self.link_failures),
            stale_advertisements: load(&self.stale_advertisements),
            retransmissions: load(&self.retransmissions),
            delivery_failures: load(&self.delivery_failures),
        }
    }
}

/// What an inbound handler changed
#[derive(Debug, Default, Clone, Copy)]
struct Outcome {
    peers_changed: bool,
    routes_changed: bool,
}

pub struct MessageDispatcher {
    local_id: PeerId,
    config: MeshConfig,
    link: Arc<dyn LinkLayer>,
    peers: PeerRegistry,
    routes: RwLock<RoutingTable>,
    reliability: ReliabilityTracker,
    events: Arc<MeshEvents>,
    /// Relay-level duplicate suppression, keyed by (id, attempt)
    seen: Mutex<SeenCache<(MessageId, u8)>>,
    /// Broadcasts by (id, attempt), with the highest TTL relayed so far
    flooded: Mutex<SeenCache<(MessageId, u8), u8>>,
    /// Local delivery suppression, keyed by id alone
    delivered: Mutex<SeenCache<MessageId>>,
    link_failures: DashMap<PeerId, u32>,
    next_counter: AtomicU64,
    stats: DispatchStats,
}

impl MessageDispatcher {
    pub fn new(link: Arc<dyn LinkLayer>, config: MeshConfig, events: Arc<MeshEvents>) -> Self {
        let local_id = link.local_id();
        Self {
            peers: PeerRegistry::new(local_id.clone(), &config),
            routes: RwLock::new(RoutingTable::new(local_id.clone(), config.max_route_cost)),
            reliability: ReliabilityTracker::new(config.ack_timeout(), config.max_retries),
            seen: Mutex::new(SeenCache::new(config.dedup_capacity, config.dedup_ttl())),
            flooded: Mutex::new(SeenCache::new(config.dedup_capacity, config.dedup_ttl())),
            delivered: Mutex::new(SeenCache::new(config.dedup_capacity, config.dedup_ttl())),
            link_failures: DashMap::new(),
            next_counter: AtomicU64::new(1),
            stats: DispatchStats::default(),
            local_id,
            config,
            link,
            events,
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn reliability(&self) -> &ReliabilityTracker {
        &self.reliability
    }

    pub fn stats(&self) -> DispatchCounters {
        self.stats.snapshot()
    }

    /// Allocate the next locally unique message id
    pub fn next_id(&self) -> MessageId {
        MessageId::new(self.local_id.clone(), self.next_counter.fetch_add(1, Ordering::Relaxed))
    }

    pub fn best_route(&self, destination: &PeerId) -> Option<RouteEntry> {
        self.routes.read().best_route(destination)
    }

    pub fn route_snapshot(&self) -> Vec<RouteEntry> {
        self.routes.read().snapshot()
    }

    pub fn routing_neighbors(&self) -> Vec<PeerId> {
        self.routes.read().neighbors()
    }

    /// Entry point for every message the link layer delivers
    pub fn handle_inbound(&self, message: Message, arrived_from: PeerId) {
        debug!(
            "Inbound {:?} {} from {} via {} (ttl {})",
            message.message_type(),
            message.id,
            message.sender,
            arrived_from,
            message.ttl
        );

        let mut outcome = Outcome {
            peers_changed: self.peers.register_or_refresh(&arrived_from, true),
            routes_changed: self.ensure_neighbor(&arrived_from),
        };
        if message.sender != arrived_from {
            outcome.peers_changed |= self.peers.register_or_refresh(&message.sender, false);
        }
        self.link_failures.remove(&arrived_from);

        match &message.kind {
            MessageKind::PeerDiscovery(discovery) => {
                let handled = self.handle_discovery(discovery, &arrived_from);
                outcome.peers_changed |= handled.peers_changed;
                outcome.routes_changed |= handled.routes_changed;
            }
            MessageKind::RouteUpdate(advertisement) => {
                let handled = self.handle_route_update(advertisement, &arrived_from);
                outcome.peers_changed |= handled.peers_changed;
                outcome.routes_changed |= handled.routes_changed;
            }
            MessageKind::Text(_) | MessageKind::System(_) => {
                self.handle_data(&message, &arrived_from);
            }
            MessageKind::Ack(acked) => {
                self.handle_ack(&message, acked);
            }
        }

        if outcome.routes_changed {
            self.advertise_routes();
        }
        if outcome.peers_changed {
            self.events.peer_list_changed(self.peers.list_peers());
        }
    }

    fn ensure_neighbor(&self, peer: &PeerId) -> bool {
        let cost = self.link.link_cost(peer);
        let added = self.routes.write().add_neighbor(peer, cost);
        if added {
            info!("Neighbor {} linked (cost {})", peer, cost);
        }
        added
    }

    fn handle_discovery(&self, discovery: &DiscoveryPayload, arrived_from: &PeerId) -> Outcome {
        let mut outcome = Outcome::default();

        for peer_id in &discovery.known_peers {
            if !self.peers.is_known(peer_id) {
                outcome.peers_changed |= self.peers.note_mentioned(peer_id);
            }
        }

        if !discovery.reply {
            // A fresh beacon means the neighbor (re)joined; it needs our vector
            // and may have restarted its sequence numbers.
            self.routes.write().reset_origin(arrived_from);
            outcome.routes_changed = true;

            let reply = Message::discovery(
                self.next_id(),
                self.local_id.clone(),
                Destination::Peer(arrived_from.clone()),
                DiscoveryPayload {
                    known_peers: self.known_peer_ids(),
                    reply: true,
                },
            );
            if let Err(e) = self.transmit(arrived_from, &reply) {
                debug!("Discovery reply to {} failed: {}", arrived_from, e);
            }
        }

        outcome
    }

    fn handle_route_update(&self, advertisement: &RouteAdvertisement, from: &PeerId) -> Outcome {
        let result = self
            .routes
            .write()
            .apply_advertisement(from, advertisement.sequence, &advertisement.routes);

        match result {
            Ok(changed) => {
                let mut peers_changed = false;
                for (destination, cost) in &advertisement.routes {
                    if destination != from && *cost < self.config.max_route_cost {
                        peers_changed |= self.peers.note_mentioned(destination);
                    }
                }
                if !changed.is_empty() {
                    debug!("Routes changed via {}: {:?}", from, changed);
                }
                Outcome {
                    peers_changed,
                    routes_changed: !changed.is_empty(),
                }
            }
            Err(e) => {
                DispatchStats::bump(&self.stats.stale_advertisements);
                debug!("Ignoring advertisement: {}", e);
                Outcome::default()
            }
        }
    }

    fn handle_data(&self, message: &Message, arrived_from: &PeerId) {
        match &message.destination {
            Destination::Peer(destination) if *destination == self.local_id => {
                self.deliver_local(message);
            }
            Destination::Peer(destination) => self.forward_unicast(message, destination),
            Destination::Broadcast => self.flood(message, Some(arrived_from)),
        }
    }

    fn handle_ack(&self, message: &Message, acked: &MessageId) {
        match &message.destination {
            Destination::Peer(destination) if *destination == self.local_id => {
                if self.reliability.on_ack(acked) {
                    info!("Delivery confirmed for {}", acked);
                    self.events.delivery_confirmed(acked);
                } else {
                    debug!("ACK for unknown or settled message {}", acked);
                }
            }
            Destination::Peer(destination) => self.forward_unicast(message, destination),
            Destination::Broadcast => debug!("Dropping broadcast ACK {}", message.id),
        }
    }

    /// Hand a message to the UI, once per id. Unicast TEXT is acknowledged
    /// every time it arrives so a lost ACK is repaired by the retransmission.
    fn deliver_local(&self, message: &Message) {
        let acknowledge = matches!(message.kind, MessageKind::Text(_))
            && !message.is_broadcast()
            && message.sender != self.local_id;
        if acknowledge {
            self.send_ack(message);
        }

        if !self.delivered.lock().check_and_insert(message.id.clone()) {
            DispatchStats::bump(&self.stats.duplicates);
            debug!("Already delivered {}", message.id);
            return;
        }
        DispatchStats::bump(&self.stats.delivered);

        if let Some(SystemNotice::PeerLeaving) = message.system_notice() {
            info!("Peer {} is leaving the mesh", message.sender);
            self.handle_neighbor_lost(&message.sender);
        }

        self.events.message_delivered(message);
    }

    fn send_ack(&self, message: &Message) {
        let ack = Message::ack(
            self.next_id(),
            self.local_id.clone(),
            message.sender.clone(),
            self.config.default_ttl,
            message.id.clone(),
        );
        if let Err(e) = self.originate(&ack) {
            debug!("Could not acknowledge {}: {}", message.id, e);
        }
    }

    fn forward_unicast(&self, message: &Message, destination: &PeerId) {
        if !self
            .seen
            .lock()
            .check_and_insert((message.id.clone(), message.attempt))
        {
            DispatchStats::bump(&self.stats.duplicates);
            debug!("Dropping duplicate {} (attempt {})", message.id, message.attempt);
            return;
        }

        if message.ttl == 0 {
            DispatchStats::bump(&self.stats.ttl_exhausted);
            debug!("{}", MeshError::TtlExhausted { message_id: message.id.to_string() });
            return;
        }

        let route = self.routes.read().best_route(destination);
        match route {
            Some(route) => {
                if self.transmit(&route.next_hop, message).is_ok() {
                    DispatchStats::bump(&self.stats.forwarded);
                }
            }
            None => {
                DispatchStats::bump(&self.stats.no_route);
                debug!(
                    "Dropping {}: {}",
                    message.id,
                    MeshError::RouteNotFound { destination: destination.to_string() }
                );
                if matches!(message.kind, MessageKind::Text(_)) {
                    self.notify_unreachable(message, destination);
                }
            }
        }
    }

    fn notify_unreachable(&self, message: &Message, destination: &PeerId) {
        let notice = SystemNotice::Unreachable {
            message_id: message.id.clone(),
            destination: destination.clone(),
        };
        let result = Message::system(
            self.next_id(),
            self.local_id.clone(),
            Destination::Peer(message.sender.clone()),
            self.config.default_ttl,
            &notice,
        )
        .and_then(|notice| self.originate(&notice));

        if let Err(e) = result {
            debug!("Could not notify {} about unreachable {}: {}", message.sender, destination, e);
        }
    }

    /// Re-emit a broadcast to every neighbor except where it came from.
    /// `arrived_from` is None for locally originated broadcasts.
    ///
    /// A later copy with more hops left than any copy seen so far is relayed
    /// again, so the hop radius holds whatever order copies arrive in. It is
    /// not delivered locally a second time.
    fn flood(&self, message: &Message, arrived_from: Option<&PeerId>) {
        let sighting = self
            .flooded
            .lock()
            .observe((message.id.clone(), message.attempt), message.ttl);

        match sighting {
            Sighting::Repeat => {
                DispatchStats::bump(&self.stats.duplicates);
                debug!("Dropping duplicate broadcast {}", message.id);
                return;
            }
            Sighting::Improved => {
                debug!("Re-flooding {} with more hops left (ttl {})", message.id, message.ttl);
            }
            Sighting::First => {
                if arrived_from.is_some() {
                    self.deliver_local(message);
                }
            }
        }

        if message.ttl == 0 {
            if arrived_from.is_some() {
                DispatchStats::bump(&self.stats.ttl_exhausted);
            }
            return;
        }

        let neighbors = self.routes.read().neighbors();
        for neighbor in neighbors {
            if Some(&neighbor) == arrived_from || neighbor == message.sender {
                continue;
            }
            if self.transmit(&neighbor, message).is_ok() && arrived_from.is_some() {
                DispatchStats::bump(&self.stats.forwarded);
            }
        }
    }

    /// Send a locally created message (or a retransmission) into the mesh
    pub fn originate(&self, message: &Message) -> MeshResult<()> {
        match &message.destination {
            Destination::Peer(destination) if *destination == self.local_id => {
                self.deliver_local(message);
                Ok(())
            }
            Destination::Peer(destination) => {
                self.seen
                    .lock()
                    .check_and_insert((message.id.clone(), message.attempt));
                if message.ttl == 0 {
                    return Err(MeshError::TtlExhausted {
                        message_id: message.id.to_string(),
                    });
                }
                let route = self.routes.read().best_route(destination);
                match route {
                    Some(route) => self.transmit(&route.next_hop, message),
                    None => Err(MeshError::RouteNotFound {
                        destination: destination.to_string(),
                    }),
                }
            }
            Destination::Broadcast => {
                if message.ttl == 0 {
                    return Err(MeshError::TtlExhausted {
                        message_id: message.id.to_string(),
                    });
                }
                self.flood(message, None);
                Ok(())
            }
        }
    }

    /// One hop over the link, spending one unit of TTL
    fn transmit(&self, next_hop: &PeerId, message: &Message) -> MeshResult<()> {
        let outbound = match message.relayed() {
            Some(outbound) => outbound,
            None => {
                return Err(MeshError::TtlExhausted {
                    message_id: message.id.to_string(),
                })
            }
        };

        if self.link.send(next_hop, &outbound) {
            self.link_failures.remove(next_hop);
            Ok(())
        } else {
            self.note_link_failure(next_hop);
            Err(MeshError::LinkUnavailable {
                peer_id: next_hop.to_string(),
            })
        }
    }

    fn note_link_failure(&self, peer: &PeerId) {
        DispatchStats::bump(&self.stats.link_failures);

        let failures = {
            let mut count = self.link_failures.entry(peer.clone()).or_insert(0);
            *count += 1;
            *count
        };
        warn!("Send to {} failed ({} in a row)", peer, failures);

        if failures >= self.config.link_failure_threshold {
            self.link_failures.remove(peer);
            self.handle_neighbor_lost(peer);
        }
    }

    /// Drop a neighbor, invalidate routes through it and tell the others
    fn handle_neighbor_lost(&self, peer: &PeerId) {
        let peers_changed = self.peers.mark_offline(peer);
        let (was_neighbor, invalidated) = {
            let mut routes = self.routes.write();
            let was_neighbor = routes.is_neighbor(peer);
            (was_neighbor, routes.on_neighbor_lost(peer))
        };

        if was_neighbor || !invalidated.is_empty() {
            info!("Lost neighbor {}; invalidated routes to {:?}", peer, invalidated);
            self.advertise_routes();
        }
        if peers_changed {
            self.events.peer_list_changed(self.peers.list_peers());
        }
    }

    /// Send the full distance vector to every neighbor
    pub fn advertise_routes(&self) {
        let (advertisement, neighbors) = {
            let mut routes = self.routes.write();
            (routes.advertisement(), routes.neighbors())
        };

        for neighbor in neighbors {
            let update = Message::route_update(
                self.next_id(),
                self.local_id.clone(),
                neighbor.clone(),
                advertisement.clone(),
            );
            if let Err(e) = self.transmit(&neighbor, &update) {
                debug!("Route update to {} failed: {}", neighbor, e);
            }
        }
    }

    /// Link-local discovery beacon. Returns how many peers heard it.
    pub fn announce(&self) -> usize {
        let beacon = Message::discovery(
            self.next_id(),
            self.local_id.clone(),
            Destination::Broadcast,
            DiscoveryPayload {
                known_peers: self.known_peer_ids(),
                reply: false,
            },
        );
        match beacon.relayed() {
            Some(outbound) => {
                let reached = self.link.broadcast(&outbound);
                debug!("Discovery beacon reached {} peer(s)", reached);
                reached
            }
            None => 0,
        }
    }

    /// Tell every neighbor this node is leaving
    pub fn notify_leaving(&self) -> MeshResult<usize> {
        let mut notified = 0;
        let neighbors = self.routes.read().neighbors();
        for neighbor in neighbors {
            let notice = Message::system(
                self.next_id(),
                self.local_id.clone(),
                Destination::Peer(neighbor.clone()),
                1,
                &SystemNotice::PeerLeaving,
            )?;
            if self.transmit(&neighbor, &notice).is_ok() {
                notified += 1;
            }
        }
        Ok(notified)
    }

    /// Retransmit overdue messages and report those out of retries
    pub fn sweep_reliability(&self) -> Vec<MessageId> {
        let sweep = self.reliability.sweep(Instant::now());

        for message in &sweep.retransmit {
            DispatchStats::bump(&self.stats.retransmissions);
            if let Err(e) = self.originate(message) {
                debug!("Retransmission of {} failed: {}", message.id, e);
            }
        }
        for message_id in &sweep.failed {
            self.report_delivery_failure(message_id);
        }
        sweep.failed
    }

    /// Surface a terminal delivery failure to the UI
    pub fn report_delivery_failure(&self, message_id: &MessageId) {
        DispatchStats::bump(&self.stats.delivery_failures);
        warn!(
            "{}",
            MeshError::DeliveryTimeout { message_id: message_id.to_string() }
        );
        self.events.delivery_failed(message_id);
        self.deliver_notice(&SystemNotice::DeliveryFailed {
            message_id: message_id.clone(),
        });
    }

    /// Deliver an informational SYSTEM message to the local UI
    pub fn deliver_notice(&self, notice: &SystemNotice) {
        match Message::system(
            self.next_id(),
            self.local_id.clone(),
            Destination::Peer(self.local_id.clone()),
            self.config.default_ttl,
            notice,
        ) {
            Ok(message) => self.deliver_local(&message),
            Err(e) => warn!("Failed to build system notice: {}", e),
        }
    }

    /// Degrade silent peers, drop routes through those gone OFFLINE and
    /// collect expired state
    pub fn sweep_liveness(&self) -> LivenessReport {
        let report = self.peers.sweep(Instant::now());
        let mut routes_changed = false;

        for peer in &report.offline {
            let mut routes = self.routes.write();
            let was_neighbor = routes.is_neighbor(peer);
            let invalidated = routes.on_neighbor_lost(peer);
            routes_changed |= was_neighbor || !invalidated.is_empty();
        }

        let mut removed = false;
        for peer in &report.expired {
            // Routes must be invalidated before the peer can be forgotten
            let still_routed = !self.routes.read().routes_through(peer).is_empty();
            if !still_routed && self.peers.remove(peer).is_some() {
                removed = true;
            }
        }

        let pruned = self.routes.write().prune_unreachable(self.config.remove_after());
        if pruned > 0 {
            debug!("Pruned {} unreachable route(s)", pruned);
        }
        self.seen.lock().prune();
        self.flooded.lock().prune();
        self.delivered.lock().prune();

        if routes_changed {
            self.advertise_routes();
        }
        if report.has_changes() || removed {
            self.events.peer_list_changed(self.peers.list_peers());
        }
        report
    }

    fn known_peer_ids(&self) -> Vec<PeerId> {
        self.peers
            .list_peers()
            .into_iter()
            .filter(|peer| peer.status != PeerStatus::Offline)
            .map(|peer| peer.id)
            .collect()
    }

    /// Forget all peers, routes and caches
    pub fn reset(&self) {
        self.routes.write().reset();
        self.peers.clear();
        self.seen.lock().clear();
        self.flooded.lock().clear();
        self.delivered.lock().clear();
        self.link_failures.clear();
    }

    /// Get dispatcher statistics
    pub fn get_statistics(&self) -> serde_json::Value {
        let routes = self.routes.read();
        serde_json::json!({
            "counters": self.stats.snapshot(),
            "routes": routes.route_count(),
            "neighbors": routes.neighbors().len(),
            "pending_acks": self.reliability.pending_count(),
            "peers": self.peers.get_statistics(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::InboundHandler;
    use crate::message::message_types::{MessageType, RouteVector};
    use std::collections::HashSet;

    /// Link that records frames instead of delivering them
    struct RecordingLink {
        local_id: PeerId,
        sent: Mutex<Vec<(PeerId, Message)>>,
        broadcasts: Mutex<Vec<Message>>,
        unreachable: Mutex<HashSet<PeerId>>,
    }

    impl RecordingLink {
        fn new(local_id: &str) -> Arc<Self> {
            Arc::new(Self {
                local_id: PeerId::from(local_id),
                sent: Mutex::new(Vec::new()),
                broadcasts: Mutex::new(Vec::new()),
                unreachable: Mutex::new(HashSet::new()),
            })
        }

        fn take(&self) -> Vec<(PeerId, Message)> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl LinkLayer for RecordingLink {
        fn local_id(&self) -> PeerId {
            self.local_id.clone()
        }

        fn send(&self, to: &PeerId, message: &Message) -> bool {
            if self.unreachable.lock().contains(to) {
                return false;
            }
            self.sent.lock().push((to.clone(), message.clone()));
            true
        }

        fn broadcast(&self, message: &Message) -> usize {
            self.broadcasts.lock().push(message.clone());
            1
        }

        fn on_receive(&self, _handler: InboundHandler) {}

        fn clear_receiver(&self) {}
    }

    fn peer(id: &str) -> PeerId {
        PeerId::from(id)
    }

    fn setup(local: &str) -> (Arc<RecordingLink>, MessageDispatcher, Arc<MeshEvents>) {
        let link = RecordingLink::new(local);
        let events = Arc::new(MeshEvents::new());
        let dispatcher = MessageDispatcher::new(link.clone(), MeshConfig::default(), events.clone());
        (link, dispatcher, events)
    }

    /// Make `via` a neighbor that advertises `routes`
    fn learn(dispatcher: &MessageDispatcher, via: &str, sequence: u64, routes: &[(&str, u32)]) {
        let routes: RouteVector = routes.iter().map(|(id, cost)| (peer(id), *cost)).collect();
        let update = Message::route_update(
            MessageId::new(peer(via), sequence),
            peer(via),
            dispatcher.local_id().clone(),
            RouteAdvertisement { sequence, routes },
        );
        dispatcher.handle_inbound(update, peer(via));
    }

    fn text(from: &str, counter: u64, to: Destination, ttl: u8) -> Message {
        Message::text(MessageId::new(peer(from), counter), peer(from), to, ttl, "payload")
    }

    #[test]
    fn forwards_unicast_along_best_route() {
        let (link, dispatcher, _) = setup("b");
        learn(&dispatcher, "c", 1, &[("c", 0)]);
        learn(&dispatcher, "a", 1, &[("a", 0)]);
        link.take();

        dispatcher.handle_inbound(text("a", 1, Destination::Peer(peer("c")), 5), peer("a"));

        let sent = link.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, peer("c"));
        assert_eq!(sent[0].1.ttl, 4);
        assert_eq!(dispatcher.stats().forwarded, 1);

        // same id and attempt again is a duplicate
        dispatcher.handle_inbound(text("a", 1, Destination::Peer(peer("c")), 5), peer("a"));
        assert!(link.take().is_empty());
        assert_eq!(dispatcher.stats().duplicates, 1);

        // a retransmission carries a new attempt and passes
        let mut retry = text("a", 1, Destination::Peer(peer("c")), 5);
        retry.attempt = 1;
        dispatcher.handle_inbound(retry, peer("a"));
        assert_eq!(link.take().len(), 1);
    }

    #[test]
    fn drops_unicast_with_exhausted_ttl() {
        let (link, dispatcher, _) = setup("b");
        learn(&dispatcher, "c", 1, &[("c", 0)]);
        link.take();

        dispatcher.handle_inbound(text("a", 1, Destination::Peer(peer("c")), 0), peer("a"));

        assert!(link.take().iter().all(|(_, m)| m.message_type() != MessageType::Text));
        assert_eq!(dispatcher.stats().ttl_exhausted, 1);
    }

    #[test]
    fn missing_route_sends_unreachable_notice() {
        let (link, dispatcher, _) = setup("b");
        link.take();

        dispatcher.handle_inbound(text("a", 1, Destination::Peer(peer("z")), 5), peer("a"));

        let notices: Vec<SystemNotice> = link
            .take()
            .into_iter()
            .filter_map(|(to, m)| if to == peer("a") { m.system_notice() } else { None })
            .collect();
        assert_eq!(
            notices,
            vec![SystemNotice::Unreachable {
                message_id: MessageId::new(peer("a"), 1),
                destination: peer("z"),
            }]
        );
        assert_eq!(dispatcher.stats().no_route, 1);
    }

    #[test]
    fn local_text_is_delivered_once_and_acked_each_time() {
        let (link, dispatcher, events) = setup("c");
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        events.on_message_delivered(Arc::new(move |m: &Message| sink.lock().push(m.id.clone())));
        link.take();

        for _ in 0..2 {
            dispatcher.handle_inbound(text("b", 1, Destination::Peer(peer("c")), 3), peer("b"));
        }

        assert_eq!(delivered.lock().len(), 1);
        let acks: Vec<MessageId> = link
            .take()
            .into_iter()
            .filter_map(|(_, m)| match m.kind {
                MessageKind::Ack(acked) => Some(acked),
                _ => None,
            })
            .collect();
        assert_eq!(acks, vec![MessageId::new(peer("b"), 1); 2]);
    }

    #[test]
    fn broadcast_is_relayed_to_other_neighbors_and_delivered() {
        let (link, dispatcher, events) = setup("b");
        let mut rx = events.subscribe();
        learn(&dispatcher, "a", 1, &[("a", 0)]);
        learn(&dispatcher, "c", 1, &[("c", 0)]);
        learn(&dispatcher, "d", 1, &[("d", 0)]);
        link.take();

        dispatcher.handle_inbound(text("a", 1, Destination::Broadcast, 2), peer("a"));

        let mut targets: Vec<PeerId> = link.take().into_iter().map(|(to, m)| {
            assert_eq!(m.ttl, 1);
            to
        }).collect();
        targets.sort();
        assert_eq!(targets, vec![peer("c"), peer("d")]);
        assert_eq!(dispatcher.stats().delivered, 1);

        let delivered = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| matches!(e, crate::mesh::events::MeshEvent::MessageDelivered(_)))
            .count();
        assert_eq!(delivered, 1);

        // copy arriving over another link is suppressed
        dispatcher.handle_inbound(text("a", 1, Destination::Broadcast, 2), peer("c"));
        assert!(link.take().is_empty());
    }

    #[test]
    fn later_broadcast_copy_with_more_hops_is_relayed_again() {
        let (link, dispatcher, events) = setup("c");
        let mut rx = events.subscribe();
        learn(&dispatcher, "a", 1, &[("a", 0)]);
        learn(&dispatcher, "b", 1, &[("b", 0)]);
        learn(&dispatcher, "d", 1, &[("d", 0)]);
        link.take();

        // a sent with ttl 2; the copy via b is spent, the direct one is not
        dispatcher.handle_inbound(text("a", 1, Destination::Broadcast, 0), peer("b"));
        assert!(link.take().is_empty());
        dispatcher.handle_inbound(text("a", 1, Destination::Broadcast, 1), peer("a"));

        let mut relayed: Vec<PeerId> = link
            .take()
            .into_iter()
            .filter(|(_, m)| m.message_type() == MessageType::Text)
            .map(|(to, m)| {
                assert_eq!(m.ttl, 0);
                to
            })
            .collect();
        relayed.sort();
        assert_eq!(relayed, vec![peer("b"), peer("d")]);

        // delivered to the UI only once
        assert_eq!(dispatcher.stats().delivered, 1);
        let delivered = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| matches!(e, crate::mesh::events::MeshEvent::MessageDelivered(_)))
            .count();
        assert_eq!(delivered, 1);

        // neither copy is relayed a third time
        dispatcher.handle_inbound(text("a", 1, Destination::Broadcast, 1), peer("b"));
        assert!(link.take().is_empty());
    }

    #[test]
    fn broadcast_with_zero_ttl_is_delivered_but_not_relayed() {
        let (link, dispatcher, _) = setup("b");
        learn(&dispatcher, "c", 1, &[("c", 0)]);
        link.take();

        dispatcher.handle_inbound(text("a", 1, Destination::Broadcast, 0), peer("a"));

        assert!(link.take().iter().all(|(_, m)| m.message_type() != MessageType::Text));
        assert_eq!(dispatcher.stats().delivered, 1);
    }

    #[test]
    fn ack_settles_pending_message_once() {
        let (link, dispatcher, events) = setup("a");
        let mut rx = events.subscribe();
        learn(&dispatcher, "b", 1, &[("b", 0), ("c", 1)]);
        link.take();

        let message = text("a", 99, Destination::Peer(peer("c")), 5);
        dispatcher.reliability().track_outbound(message.clone());
        dispatcher.originate(&message).unwrap();

        let ack = Message::ack(MessageId::new(peer("c"), 1), peer("c"), peer("a"), 3, message.id.clone());
        dispatcher.handle_inbound(ack.clone(), peer("b"));
        dispatcher.handle_inbound(ack, peer("b"));

        assert_eq!(dispatcher.reliability().pending_count(), 0);
        let confirmed = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| matches!(e, crate::mesh::events::MeshEvent::DeliveryConfirmed(_)))
            .count();
        assert_eq!(confirmed, 1);
    }

    #[test]
    fn originate_reports_missing_route_and_ttl() {
        let (_link, dispatcher, _) = setup("a");
        let err = dispatcher
            .originate(&text("a", 1, Destination::Peer(peer("z")), 5))
            .unwrap_err();
        assert!(matches!(err, MeshError::RouteNotFound { .. }));

        let err = dispatcher
            .originate(&text("a", 2, Destination::Broadcast, 0))
            .unwrap_err();
        assert!(matches!(err, MeshError::TtlExhausted { .. }));
    }

    #[test]
    fn repeated_link_failures_drop_the_neighbor() {
        let (link, dispatcher, _) = setup("a");
        learn(&dispatcher, "b", 1, &[("b", 0), ("c", 1)]);
        learn(&dispatcher, "d", 1, &[("d", 0), ("e", 1)]);
        link.unreachable.lock().insert(peer("b"));

        for counter in 0..3 {
            let _ = dispatcher.originate(&text("a", counter, Destination::Peer(peer("c")), 5));
        }

        assert!(dispatcher.best_route(&peer("c")).is_none());
        assert!(dispatcher.best_route(&peer("b")).is_none());
        assert_eq!(dispatcher.best_route(&peer("e")).unwrap().next_hop, peer("d"));
        assert_eq!(dispatcher.routing_neighbors(), vec![peer("d")]);
        assert_eq!(dispatcher.stats().link_failures, 3);
    }

    #[test]
    fn discovery_is_answered_with_a_reply() {
        let (link, dispatcher, _) = setup("b");
        let beacon = Message::discovery(
            MessageId::new(peer("a"), 1),
            peer("a"),
            Destination::Broadcast,
            DiscoveryPayload {
                known_peers: vec![peer("x")],
                reply: false,
            },
        );
        dispatcher.handle_inbound(beacon, peer("a"));

        let sent = link.take();
        let reply = sent
            .iter()
            .find_map(|(to, m)| match &m.kind {
                MessageKind::PeerDiscovery(d) if *to == peer("a") => Some(d.clone()),
                _ => None,
            })
            .unwrap();
        assert!(reply.reply);
        assert!(reply.known_peers.contains(&peer("a")));
        assert!(sent.iter().any(|(_, m)| m.message_type() == MessageType::RouteUpdate));
        assert!(dispatcher.peers().is_known(&peer("x")));

        // replies are not answered again
        let answer = Message::discovery(
            MessageId::new(peer("a"), 2),
            peer("a"),
            Destination::Peer(peer("b")),
            DiscoveryPayload { known_peers: vec![], reply: true },
        );
        dispatcher.handle_inbound(answer, peer("a"));
        assert!(link.take().is_empty());
    }

    #[test]
    fn peer_leaving_invalidates_routes_through_it() {
        let (link, dispatcher, _) = setup("a");
        learn(&dispatcher, "b", 1, &[("b", 0), ("c", 1)]);
        link.take();

        let notice = Message::system(
            MessageId::new(peer("b"), 50),
            peer("b"),
            Destination::Peer(peer("a")),
            0,
            &SystemNotice::PeerLeaving,
        )
        .unwrap();
        dispatcher.handle_inbound(notice, peer("b"));

        assert!(dispatcher.best_route(&peer("c")).is_none());
        assert!(dispatcher.routing_neighbors().is_empty());
        assert_eq!(
            dispatcher.peers().get_peer(&peer("b")).unwrap().status,
            PeerStatus::Offline
        );
    }
}
