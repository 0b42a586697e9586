//! Mesh Coordination Module
//!
//! Peer lifecycle, UI events and the coordinator facade that runs one mesh
//! node over a link layer.

pub mod coordinator;
pub mod events;
pub mod peer_registry;

pub use coordinator::{ConnectionState, MeshCoordinator};
pub use events::{MeshEvent, MeshEvents};
pub use peer_registry::{Peer, PeerRegistry, PeerStatus};
