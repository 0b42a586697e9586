//! Distance-Vector Routing Table
//!
//! Each node keeps the best known (cost, next hop) per destination, derived
//! from its direct links and the vectors its neighbors advertise. Split
//! horizon is not applied; transient loops are bounded by the TTL of the
//! data messages that would traverse them and by `max_cost`, which turns
//! counting-to-infinity into a finite climb.

use log::debug;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{MeshError, MeshResult};
use crate::message::message_types::{Cost, PeerId, RouteAdvertisement, RouteVector, UNREACHABLE};

/// Best known route to one destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteEntry {
    pub destination: PeerId,
    pub cost: Cost,
    pub next_hop: PeerId,
    /// Sequence of the advertisement that last set this entry
    pub sequence: u64,
    #[serde(skip)]
    pub updated_at: Instant,
}

impl RouteEntry {
    pub fn is_reachable(&self) -> bool {
        self.cost != UNREACHABLE
    }
}

pub struct RoutingTable {
    local_id: PeerId,
    max_cost: Cost,
    neighbors: HashMap<PeerId, Cost>,
    routes: HashMap<PeerId, RouteEntry>,
    /// Last applied sequence per (advertiser, destination)
    applied: HashMap<PeerId, HashMap<PeerId, u64>>,
    next_sequence: u64,
}

impl RoutingTable {
    pub fn new(local_id: PeerId, max_cost: Cost) -> Self {
        // Seeded from the wall clock so a restarted node outranks its old adverts
        let seed = chrono::Utc::now().timestamp_millis().max(0) as u64;
        Self {
            local_id,
            max_cost,
            neighbors: HashMap::new(),
            routes: HashMap::new(),
            applied: HashMap::new(),
            next_sequence: seed,
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Add or re-cost a direct link. Returns true if the table changed.
    pub fn add_neighbor(&mut self, peer: &PeerId, cost: Cost) -> bool {
        if *peer == self.local_id {
            return false;
        }
        let cost = cost.max(1);
        let added = self.neighbors.insert(peer.clone(), cost) != Some(cost);

        let replace = match self.routes.get(peer) {
            None => true,
            Some(entry) => cost < entry.cost || (entry.next_hop == *peer && entry.cost != cost),
        };
        if replace {
            let sequence = self.routes.get(peer).map(|e| e.sequence).unwrap_or_default();
            self.routes.insert(
                peer.clone(),
                RouteEntry {
                    destination: peer.clone(),
                    cost,
                    next_hop: peer.clone(),
                    sequence,
                    updated_at: Instant::now(),
                },
            );
        }

        added || replace
    }

    /// Cost of the direct link to `peer`, or `UNREACHABLE` if it is not a neighbor
    pub fn direct_link_cost(&self, peer: &PeerId) -> Cost {
        self.neighbors.get(peer).copied().unwrap_or(UNREACHABLE)
    }

    pub fn is_neighbor(&self, peer: &PeerId) -> bool {
        self.neighbors.contains_key(peer)
    }

    /// Apply a neighbor's distance vector and return the destinations whose
    /// entry changed.
    ///
    /// Entries older than one already applied from the same advertiser are
    /// skipped; if every entry is stale the whole advertisement is rejected.
    pub fn apply_advertisement(
        &mut self,
        from: &PeerId,
        sequence: u64,
        vector: &RouteVector,
    ) -> MeshResult<BTreeSet<PeerId>> {
        let mut changed = BTreeSet::new();

        let link_cost = match self.neighbors.get(from) {
            Some(cost) => *cost,
            None => {
                debug!("Ignoring advertisement from non-neighbor {}", from);
                return Ok(changed);
            }
        };

        let max_cost = self.max_cost;
        let now = Instant::now();
        let applied = self.applied.entry(from.clone()).or_default();
        let mut fresh = 0usize;
        let mut stale = 0usize;

        for (destination, advertised) in vector {
            if *destination == self.local_id {
                continue;
            }
            if let Some(last) = applied.get(destination) {
                if sequence < *last {
                    stale += 1;
                    continue;
                }
            }
            applied.insert(destination.clone(), sequence);
            fresh += 1;

            let mut candidate = link_cost.saturating_add(*advertised);
            if candidate >= max_cost {
                candidate = UNREACHABLE;
            }

            match self.routes.get_mut(destination) {
                None => {
                    if candidate != UNREACHABLE {
                        self.routes.insert(
                            destination.clone(),
                            RouteEntry {
                                destination: destination.clone(),
                                cost: candidate,
                                next_hop: from.clone(),
                                sequence,
                                updated_at: now,
                            },
                        );
                        changed.insert(destination.clone());
                    }
                }
                Some(entry) => {
                    let via_from = entry.next_hop == *from;
                    if candidate < entry.cost || (via_from && candidate != entry.cost) {
                        entry.cost = candidate;
                        entry.next_hop = from.clone();
                        entry.sequence = sequence;
                        entry.updated_at = now;
                        changed.insert(destination.clone());
                    } else if via_from {
                        entry.sequence = sequence;
                    }
                }
            }
        }

        if fresh == 0 && stale > 0 {
            return Err(MeshError::StaleAdvertisement {
                from: from.to_string(),
                sequence,
            });
        }

        Ok(changed)
    }

    /// Best reachable route to `destination`
    pub fn best_route(&self, destination: &PeerId) -> Option<RouteEntry> {
        self.routes
            .get(destination)
            .filter(|entry| entry.is_reachable())
            .cloned()
    }

    /// Invalidate every route through `peer` and drop it as a neighbor.
    /// Returns the destinations that became unreachable.
    pub fn on_neighbor_lost(&mut self, peer: &PeerId) -> BTreeSet<PeerId> {
        let now = Instant::now();
        let mut invalidated = BTreeSet::new();

        for entry in self.routes.values_mut() {
            if entry.next_hop == *peer && entry.is_reachable() {
                entry.cost = UNREACHABLE;
                entry.updated_at = now;
                invalidated.insert(entry.destination.clone());
            }
        }

        self.neighbors.remove(peer);
        self.applied.remove(peer);
        invalidated
    }

    /// Forget the sequences applied from `peer`, e.g. after it rejoined
    pub fn reset_origin(&mut self, peer: &PeerId) {
        self.applied.remove(peer);
    }

    /// Reachable destinations currently routed through `peer`
    pub fn routes_through(&self, peer: &PeerId) -> BTreeSet<PeerId> {
        self.routes
            .values()
            .filter(|entry| entry.next_hop == *peer && entry.is_reachable())
            .map(|entry| entry.destination.clone())
            .collect()
    }

    /// Full vector for the neighbors, unreachable entries included, stamped
    /// with a fresh sequence number
    pub fn advertisement(&mut self) -> RouteAdvertisement {
        let mut routes = RouteVector::new();
        routes.insert(self.local_id.clone(), 0);
        for entry in self.routes.values() {
            routes.insert(entry.destination.clone(), entry.cost);
        }

        self.next_sequence += 1;
        RouteAdvertisement {
            sequence: self.next_sequence,
            routes,
        }
    }

    /// Drop unreachable entries that have been advertised for at least `max_age`
    pub fn prune_unreachable(&mut self, max_age: Duration) -> usize {
        let now = Instant::now();
        let before = self.routes.len();
        self.routes
            .retain(|_, entry| entry.is_reachable() || now.duration_since(entry.updated_at) < max_age);
        before - self.routes.len()
    }

    pub fn neighbors(&self) -> Vec<PeerId> {
        let mut neighbors: Vec<PeerId> = self.neighbors.keys().cloned().collect();
        neighbors.sort();
        neighbors
    }

    /// All entries ordered by destination
    pub fn snapshot(&self) -> Vec<RouteEntry> {
        let mut entries: Vec<RouteEntry> = self.routes.values().cloned().collect();
        entries.sort_by(|a, b| a.destination.cmp(&b.destination));
        entries
    }

    pub fn route_count(&self) -> usize {
        self.routes.values().filter(|entry| entry.is_reachable()).count()
    }

    /// Forget all links and routes; the sequence counter keeps advancing
    pub fn reset(&mut self) {
        self.neighbors.clear();
        self.routes.clear();
        self.applied.clear();
    }
}
