//! Peer Registry
//!
//! Tracks every peer this node has heard from or heard about, whether it is
//! a direct neighbor, and how recently it was seen. Liveness only degrades in
//! the sweep (ONLINE -> STALE -> OFFLINE); any contact restores ONLINE.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::MeshConfig;
use crate::message::message_types::PeerId;

/// Liveness derived from time since last contact
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerStatus {
    Online,
    Stale,
    Offline,
}

/// Snapshot of a known peer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub id: PeerId,
    pub is_neighbor: bool,
    pub status: PeerStatus,
    #[serde(skip)]
    pub last_seen: Instant,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub message_count: u64,
}

impl Peer {
    fn new(id: PeerId, is_neighbor: bool) -> Self {
        let now = Utc::now();
        Self {
            id,
            is_neighbor,
            status: PeerStatus::Online,
            last_seen: Instant::now(),
            first_seen_at: now,
            last_seen_at: now,
            message_count: 0,
        }
    }

    fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.last_seen_at = Utc::now();
    }
}

/// Peers whose status changed during a sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LivenessReport {
    pub stale: Vec<PeerId>,
    pub offline: Vec<PeerId>,
    /// OFFLINE for longer than the removal grace period
    pub expired: Vec<PeerId>,
}

impl LivenessReport {
    pub fn has_changes(&self) -> bool {
        !self.stale.is_empty() || !self.offline.is_empty()
    }
}

/// Manages all known peers and their liveness
pub struct PeerRegistry {
    local_id: PeerId,
    peers: DashMap<PeerId, Peer>,
    stale_after: Duration,
    offline_after: Duration,
    remove_after: Duration,
}

impl PeerRegistry {
    pub fn new(local_id: PeerId, config: &MeshConfig) -> Self {
        Self {
            local_id,
            peers: DashMap::new(),
            stale_after: config.stale_after(),
            offline_after: config.offline_after(),
            remove_after: config.remove_after(),
        }
    }

    /// Record contact with `peer_id`. Returns true if the peer is new or its
    /// status or neighbor flag changed.
    pub fn register_or_refresh(&self, peer_id: &PeerId, is_neighbor: bool) -> bool {
        if *peer_id == self.local_id {
            return false;
        }

        if let Some(mut peer) = self.peers.get_mut(peer_id) {
            let changed = peer.status != PeerStatus::Online || (is_neighbor && !peer.is_neighbor);
            peer.touch();
            peer.status = PeerStatus::Online;
            peer.is_neighbor |= is_neighbor;
            peer.message_count += 1;
            if changed {
                debug!("Peer {} is back online (neighbor: {})", peer_id, peer.is_neighbor);
            }
            return changed;
        }

        let mut peer = Peer::new(peer_id.clone(), is_neighbor);
        peer.message_count = 1;
        self.peers.insert(peer_id.clone(), peer);
        info!("Discovered new peer: {} (neighbor: {})", peer_id, is_neighbor);
        true
    }

    /// Record that a neighbor reported `peer_id` as reachable. Hearsay does
    /// not refresh direct neighbors; only their own traffic does.
    pub fn note_mentioned(&self, peer_id: &PeerId) -> bool {
        if *peer_id == self.local_id {
            return false;
        }

        if let Some(mut peer) = self.peers.get_mut(peer_id) {
            if peer.is_neighbor {
                return false;
            }
            let changed = peer.status != PeerStatus::Online;
            peer.touch();
            peer.status = PeerStatus::Online;
            return changed;
        }

        self.peers.insert(peer_id.clone(), Peer::new(peer_id.clone(), false));
        info!("Learned about peer: {}", peer_id);
        true
    }

    /// Force a peer OFFLINE, e.g. after it announced leaving
    pub fn mark_offline(&self, peer_id: &PeerId) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(mut peer) if peer.status != PeerStatus::Offline || peer.is_neighbor => {
                peer.status = PeerStatus::Offline;
                peer.is_neighbor = false;
                info!("Peer {} is offline", peer_id);
                true
            }
            _ => false,
        }
    }

    /// Degrade peers that have been silent past the thresholds
    pub fn sweep(&self, now: Instant) -> LivenessReport {
        let mut report = LivenessReport::default();

        for mut entry in self.peers.iter_mut() {
            let silent_for = now.saturating_duration_since(entry.last_seen);
            let peer = entry.value_mut();

            if silent_for >= self.offline_after {
                if peer.status != PeerStatus::Offline {
                    peer.status = PeerStatus::Offline;
                    peer.is_neighbor = false;
                    report.offline.push(peer.id.clone());
                } else if silent_for >= self.remove_after {
                    report.expired.push(peer.id.clone());
                }
            } else if silent_for >= self.stale_after && peer.status == PeerStatus::Online {
                peer.status = PeerStatus::Stale;
                report.stale.push(peer.id.clone());
            }
        }

        report.stale.sort();
        report.offline.sort();
        report.expired.sort();
        for peer_id in &report.offline {
            info!("Peer {} timed out", peer_id);
        }
        report
    }

    pub fn remove(&self, peer_id: &PeerId) -> Option<Peer> {
        let removed = self.peers.remove(peer_id).map(|(_, peer)| peer);
        if removed.is_some() {
            debug!("Removed offline peer: {}", peer_id);
        }
        removed
    }

    /// All peers ordered by id
    pub fn list_peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.iter().map(|entry| entry.value().clone()).collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn is_known(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn get_peer(&self, peer_id: &PeerId) -> Option<Peer> {
        self.peers.get(peer_id).map(|entry| entry.value().clone())
    }

    /// Peers with a live direct link
    pub fn neighbors(&self) -> Vec<PeerId> {
        let mut neighbors: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|entry| entry.is_neighbor && entry.status != PeerStatus::Offline)
            .map(|entry| entry.key().clone())
            .collect();
        neighbors.sort();
        neighbors
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&self) {
        self.peers.clear();
    }

    /// Get peer statistics
    pub fn get_statistics(&self) -> serde_json::Value {
        let count = |status: PeerStatus| self.peers.iter().filter(|e| e.status == status).count();

        serde_json::json!({
            "total_peers": self.peers.len(),
            "online_peers": count(PeerStatus::Online),
            "stale_peers": count(PeerStatus::Stale),
            "offline_peers": count(PeerStatus::Offline),
            "neighbors": self.neighbors().len(),
            "own_peer_id": self.local_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PeerRegistry {
        PeerRegistry::new(PeerId::from("self"), &MeshConfig::default())
    }

    #[test]
    fn registers_and_refreshes_peers() {
        let registry = registry();
        assert!(registry.register_or_refresh(&PeerId::from("b"), true));
        assert!(!registry.register_or_refresh(&PeerId::from("b"), false));
        assert!(!registry.register_or_refresh(&PeerId::from("self"), true));

        let peer = registry.get_peer(&PeerId::from("b")).unwrap();
        assert!(peer.is_neighbor);
        assert_eq!(peer.message_count, 2);
        assert!(registry.is_known(&PeerId::from("b")));
        assert!(!registry.is_known(&PeerId::from("self")));
    }

    #[test]
    fn mentioned_peers_are_not_neighbors() {
        let registry = registry();
        assert!(registry.note_mentioned(&PeerId::from("c")));
        assert!(!registry.note_mentioned(&PeerId::from("c")));
        assert!(registry.neighbors().is_empty());

        assert!(registry.register_or_refresh(&PeerId::from("c"), true));
        assert_eq!(registry.neighbors(), vec![PeerId::from("c")]);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_degrades_status_over_time() {
        let registry = registry();
        registry.register_or_refresh(&PeerId::from("b"), true);
        registry.register_or_refresh(&PeerId::from("c"), true);

        tokio::time::advance(Duration::from_secs(16)).await;
        registry.register_or_refresh(&PeerId::from("c"), true);
        let report = registry.sweep(Instant::now());
        assert_eq!(report.stale, vec![PeerId::from("b")]);
        assert!(report.offline.is_empty());

        tokio::time::advance(Duration::from_secs(15)).await;
        let report = registry.sweep(Instant::now());
        assert_eq!(report.offline, vec![PeerId::from("b")]);
        assert_eq!(report.stale, vec![PeerId::from("c")]);
        assert_eq!(registry.neighbors(), vec![PeerId::from("c")]);

        // contact restores ONLINE
        assert!(registry.register_or_refresh(&PeerId::from("b"), true));
        assert_eq!(registry.get_peer(&PeerId::from("b")).unwrap().status, PeerStatus::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_peers_expire_after_grace_period() {
        let registry = registry();
        registry.register_or_refresh(&PeerId::from("b"), true);
        assert!(registry.mark_offline(&PeerId::from("b")));
        assert!(!registry.mark_offline(&PeerId::from("b")));

        tokio::time::advance(Duration::from_secs(121)).await;
        let report = registry.sweep(Instant::now());
        assert_eq!(report.expired, vec![PeerId::from("b")]);
        assert!(registry.remove(&PeerId::from("b")).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn lists_peers_in_id_order() {
        let registry = registry();
        for id in ["d", "a", "c"] {
            registry.register_or_refresh(&PeerId::from(id), false);
        }
        let ids: Vec<String> = registry.list_peers().iter().map(|p| p.id.to_string()).collect();
        assert_eq!(ids, vec!["a", "c", "d"]);
        assert_eq!(registry.get_statistics()["total_peers"], 3);
    }
}
