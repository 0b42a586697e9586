//! Message Handling Module
//!
//! Message types, duplicate suppression, distance-vector routing,
//! acknowledgment tracking and the dispatcher tying them together.

pub mod dispatcher;
pub mod message_types;
pub mod reliability;
pub mod routing_table;
pub mod seen_cache;

pub use dispatcher::{DispatchCounters, MessageDispatcher};
pub use message_types::{
    Destination, Message, MessageId, MessageKind, MessageType, PeerId, SystemNotice,
};
pub use reliability::ReliabilityTracker;
pub use routing_table::{RouteEntry, RoutingTable};
