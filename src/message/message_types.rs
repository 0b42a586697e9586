//! Message Type Definitions
//!
//! Defines the identifiers and message structures exchanged between mesh
//! peers. Each message kind carries its own payload type so handlers can be
//! matched exhaustively.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{MeshError, MeshResult};

/// Reserved destination value meaning "all peers"
pub const BROADCAST_SENTINEL: &str = "*";

/// Hop/metric cost of a route
pub type Cost = u32;

/// Cost of an unreachable destination
pub const UNREACHABLE: Cost = Cost::MAX;

/// Advertised destination -> cost mapping
pub type RouteVector = BTreeMap<PeerId, Cost>;

/// Stable identifier of a peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> MeshResult<Self> {
        let id = id.into();
        if id.is_empty() || id == BROADCAST_SENTINEL || id.contains('#') {
            return Err(MeshError::InvalidState(format!("Invalid peer id: {:?}", id)));
        }
        Ok(Self(id))
    }

    /// Random identifier for a node that was not given one
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unchecked conversion for ids known to be valid; use `PeerId::new` for
/// anything read from outside.
impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Unique message identifier: originating peer plus a monotonic counter
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId {
    pub origin: PeerId,
    pub counter: u64,
}

impl MessageId {
    pub fn new(origin: PeerId, counter: u64) -> Self {
        Self { origin, counter }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.origin, self.counter)
    }
}

impl FromStr for MessageId {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (origin, counter) = s
            .rsplit_once('#')
            .ok_or_else(|| MeshError::Codec(format!("Malformed message id: {}", s)))?;
        let counter = counter
            .parse()
            .map_err(|_| MeshError::Codec(format!("Malformed message counter: {}", s)))?;
        Ok(Self::new(PeerId::new(origin).map_err(|e| MeshError::Codec(e.to_string()))?, counter))
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Unicast target or the broadcast sentinel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    Broadcast,
    Peer(PeerId),
}

impl Destination {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Destination::Broadcast)
    }

    pub fn peer(&self) -> Option<&PeerId> {
        match self {
            Destination::Peer(peer_id) => Some(peer_id),
            Destination::Broadcast => None,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Broadcast => f.write_str(BROADCAST_SENTINEL),
            Destination::Peer(peer_id) => write!(f, "{}", peer_id),
        }
    }
}

impl From<PeerId> for Destination {
    fn from(peer_id: PeerId) -> Self {
        Destination::Peer(peer_id)
    }
}

impl From<&PeerId> for Destination {
    fn from(peer_id: &PeerId) -> Self {
        Destination::Peer(peer_id.clone())
    }
}

impl Serialize for Destination {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Destination {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw == BROADCAST_SENTINEL {
            return Ok(Destination::Broadcast);
        }
        PeerId::new(raw)
            .map(Destination::Peer)
            .map_err(serde::de::Error::custom)
    }
}

/// Wire-level message type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Text,
    System,
    RouteUpdate,
    PeerDiscovery,
    Ack,
}

/// Distance vector stamped with the advertiser's sequence number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteAdvertisement {
    pub sequence: u64,
    pub routes: RouteVector,
}

/// Peer-list exchange carried by PEER_DISCOVERY
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryPayload {
    pub known_peers: Vec<PeerId>,
    /// Set on the answer to a discovery so it is not answered again
    #[serde(default)]
    pub reply: bool,
}

/// Informational notices carried in SYSTEM payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum SystemNotice {
    PeerLeaving,
    #[serde(rename_all = "camelCase")]
    Unreachable {
        message_id: MessageId,
        destination: PeerId,
    },
    #[serde(rename_all = "camelCase")]
    DeliveryFailed { message_id: MessageId },
}

impl SystemNotice {
    pub fn to_payload(&self) -> MeshResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        serde_json::from_slice(payload).ok()
    }
}

/// Closed set of message kinds with their payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Text(Vec<u8>),
    System(Vec<u8>),
    RouteUpdate(RouteAdvertisement),
    PeerDiscovery(DiscoveryPayload),
    Ack(MessageId),
}

/// A message travelling through the mesh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub sender: PeerId,
    pub destination: Destination,
    pub ttl: u8,
    /// Retransmission attempt, 0 for the first transmission
    pub attempt: u8,
    pub kind: MessageKind,
}

impl Message {
    /// Create a chat message
    pub fn text(
        id: MessageId,
        sender: PeerId,
        destination: Destination,
        ttl: u8,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        Self::build(id, sender, destination, ttl, MessageKind::Text(content.into()))
    }

    /// Create a system notice
    pub fn system(
        id: MessageId,
        sender: PeerId,
        destination: Destination,
        ttl: u8,
        notice: &SystemNotice,
    ) -> MeshResult<Self> {
        Ok(Self::build(
            id,
            sender,
            destination,
            ttl,
            MessageKind::System(notice.to_payload()?),
        ))
    }

    /// Create a route advertisement for one neighbor
    pub fn route_update(
        id: MessageId,
        sender: PeerId,
        neighbor: PeerId,
        advertisement: RouteAdvertisement,
    ) -> Self {
        Self::build(
            id,
            sender,
            Destination::Peer(neighbor),
            1,
            MessageKind::RouteUpdate(advertisement),
        )
    }

    /// Create a discovery beacon or discovery reply
    pub fn discovery(
        id: MessageId,
        sender: PeerId,
        destination: Destination,
        payload: DiscoveryPayload,
    ) -> Self {
        Self::build(id, sender, destination, 1, MessageKind::PeerDiscovery(payload))
    }

    /// Create an acknowledgment for `acked`
    pub fn ack(id: MessageId, sender: PeerId, destination: PeerId, ttl: u8, acked: MessageId) -> Self {
        Self::build(id, sender, Destination::Peer(destination), ttl, MessageKind::Ack(acked))
    }

    fn build(id: MessageId, sender: PeerId, destination: Destination, ttl: u8, kind: MessageKind) -> Self {
        Self {
            id,
            sender,
            destination,
            ttl,
            attempt: 0,
            kind,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self.kind {
            MessageKind::Text(_) => MessageType::Text,
            MessageKind::System(_) => MessageType::System,
            MessageKind::RouteUpdate(_) => MessageType::RouteUpdate,
            MessageKind::PeerDiscovery(_) => MessageType::PeerDiscovery,
            MessageKind::Ack(_) => MessageType::Ack,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination.is_broadcast()
    }

    /// Text content of a TEXT message
    pub fn text_content(&self) -> Option<Cow<'_, str>> {
        match &self.kind {
            MessageKind::Text(bytes) => Some(String::from_utf8_lossy(bytes)),
            _ => None,
        }
    }

    /// Parsed notice of a SYSTEM message
    pub fn system_notice(&self) -> Option<SystemNotice> {
        match &self.kind {
            MessageKind::System(bytes) => SystemNotice::from_payload(bytes),
            _ => None,
        }
    }

    /// Copy for the next transmission with one hop less
    pub fn relayed(&self) -> Option<Self> {
        if self.ttl == 0 {
            return None;
        }
        let mut next = self.clone();
        next.ttl -= 1;
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_display_and_parse() {
        let id = MessageId::new(PeerId::from("node-a"), 42);
        assert_eq!(id.to_string(), "node-a#42");
        assert_eq!("node-a#42".parse::<MessageId>().unwrap(), id);
        assert!("node-a".parse::<MessageId>().is_err());
        assert!("node-a#x".parse::<MessageId>().is_err());
    }

    #[test]
    fn peer_id_rejects_reserved_values() {
        assert!(PeerId::new("").is_err());
        assert!(PeerId::new(BROADCAST_SENTINEL).is_err());
        assert!(PeerId::new("a#1").is_err());
        assert!(PeerId::new("alice").is_ok());
        assert_ne!(PeerId::random(), PeerId::random());
    }

    #[test]
    fn destination_uses_broadcast_sentinel() {
        let json = serde_json::to_string(&Destination::Broadcast).unwrap();
        assert_eq!(json, "\"*\"");
        let parsed: Destination = serde_json::from_str("\"bob\"").unwrap();
        assert_eq!(parsed, Destination::Peer(PeerId::from("bob")));
    }

    #[test]
    fn relayed_decrements_until_zero() {
        let id = MessageId::new(PeerId::from("a"), 1);
        let message = Message::text(id, PeerId::from("a"), Destination::Broadcast, 1, "hi");

        let next = message.relayed().unwrap();
        assert_eq!(next.ttl, 0);
        assert!(next.relayed().is_none());
        assert_eq!(message.text_content().as_deref(), Some("hi"));
    }

    #[test]
    fn system_notice_survives_payload_encoding() {
        let notice = SystemNotice::Unreachable {
            message_id: MessageId::new(PeerId::from("a"), 3),
            destination: PeerId::from("c"),
        };
        let message = Message::system(
            MessageId::new(PeerId::from("b"), 9),
            PeerId::from("b"),
            Destination::Peer(PeerId::from("a")),
            4,
            &notice,
        )
        .unwrap();

        assert_eq!(message.message_type(), MessageType::System);
        assert_eq!(message.system_notice(), Some(notice));
    }
}
