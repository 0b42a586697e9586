//! Link Layer
//!
//! The capability the mesh coordinator needs from a transport: unicast sends
//! to direct neighbors, a link-local broadcast for discovery beacons, and an
//! inbound callback. The in-memory simulation implements it for tests and the
//! demo; a radio transport would implement the same trait.

pub mod protocol;
pub mod simulated;

pub use protocol::MeshProtocol;
pub use simulated::{SimulatedLink, SimulatedNetwork};

use std::sync::Arc;

use crate::message::message_types::{Cost, Message, PeerId};

/// Callback invoked with each inbound message and the neighbor it arrived from
pub type InboundHandler = Arc<dyn Fn(Message, PeerId) + Send + Sync>;

pub trait LinkLayer: Send + Sync {
    /// Identity of the local endpoint
    fn local_id(&self) -> PeerId;

    /// Send to a direct neighbor. Returns true if the link accepted the frame.
    fn send(&self, to: &PeerId, message: &Message) -> bool;

    /// Send to every peer currently in range. Returns how many accepted it.
    fn broadcast(&self, message: &Message) -> usize;

    /// Metric of the direct link to `peer`
    fn link_cost(&self, _peer: &PeerId) -> Cost {
        1
    }

    /// Install the inbound callback, replacing any previous one
    fn on_receive(&self, handler: InboundHandler);

    /// Remove the inbound callback; frames for this endpoint are refused
    fn clear_receiver(&self);
}
