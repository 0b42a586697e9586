//! Mesh Wire Protocol
//!
//! JSON frame format shared by every link implementation. Byte payloads are
//! hex encoded so frames stay printable in logs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MeshError, MeshResult};
use crate::message::message_types::{
    Destination, DiscoveryPayload, Message, MessageId, MessageKind, MessageType, PeerId,
    RouteAdvertisement, RouteVector,
};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest frame accepted by `decode`
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    version: u8,
    id: MessageId,
    #[serde(rename = "type")]
    message_type: MessageType,
    sender: PeerId,
    destination: Destination,
    ttl: u8,
    #[serde(default)]
    attempt: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sequence: Option<u64>,
    payload: Value,
}

/// Mesh protocol handler
pub struct MeshProtocol;

impl MeshProtocol {
    /// Encode a message into a wire frame
    pub fn encode(message: &Message) -> MeshResult<Vec<u8>> {
        let (payload, sequence) = match &message.kind {
            MessageKind::Text(bytes) | MessageKind::System(bytes) => {
                (Value::String(hex::encode(bytes)), None)
            }
            MessageKind::RouteUpdate(advertisement) => (
                serde_json::to_value(&advertisement.routes)?,
                Some(advertisement.sequence),
            ),
            MessageKind::PeerDiscovery(discovery) => (serde_json::to_value(discovery)?, None),
            MessageKind::Ack(acked) => (Value::String(acked.to_string()), None),
        };

        let frame = WireMessage {
            version: PROTOCOL_VERSION,
            id: message.id.clone(),
            message_type: message.message_type(),
            sender: message.sender.clone(),
            destination: message.destination.clone(),
            ttl: message.ttl,
            attempt: message.attempt,
            sequence,
            payload,
        };

        let buffer = serde_json::to_vec(&frame)?;
        if buffer.len() > MAX_FRAME_SIZE {
            return Err(MeshError::Codec(format!(
                "Frame too large: {} bytes",
                buffer.len()
            )));
        }
        Ok(buffer)
    }

    /// Decode a wire frame into a message
    pub fn decode(data: &[u8]) -> MeshResult<Message> {
        if data.len() > MAX_FRAME_SIZE {
            return Err(MeshError::Codec(format!("Frame too large: {} bytes", data.len())));
        }

        let frame: WireMessage = serde_json::from_slice(data)?;
        if frame.version != PROTOCOL_VERSION {
            return Err(MeshError::Codec(format!(
                "Unsupported protocol version: {}",
                frame.version
            )));
        }

        let sender = PeerId::new(frame.sender.as_str())
            .map_err(|_| MeshError::Codec(format!("Invalid sender: {:?}", frame.sender.as_str())))?;

        match (frame.message_type, frame.sequence) {
            (MessageType::RouteUpdate, None) => {
                return Err(MeshError::Codec("ROUTE_UPDATE without sequence".into()));
            }
            (MessageType::RouteUpdate, Some(_)) | (_, None) => {}
            (other, Some(_)) => {
                return Err(MeshError::Codec(format!("Unexpected sequence on {:?}", other)));
            }
        }

        let kind = match frame.message_type {
            MessageType::Text => MessageKind::Text(Self::decode_bytes(&frame.payload)?),
            MessageType::System => MessageKind::System(Self::decode_bytes(&frame.payload)?),
            MessageType::RouteUpdate => {
                let routes: RouteVector = serde_json::from_value(frame.payload)?;
                MessageKind::RouteUpdate(RouteAdvertisement {
                    sequence: frame.sequence.unwrap_or_default(),
                    routes,
                })
            }
            MessageType::PeerDiscovery => {
                let discovery: DiscoveryPayload = serde_json::from_value(frame.payload)?;
                MessageKind::PeerDiscovery(discovery)
            }
            MessageType::Ack => {
                let acked = frame
                    .payload
                    .as_str()
                    .ok_or_else(|| MeshError::Codec("ACK payload must be a message id".into()))?
                    .parse()?;
                MessageKind::Ack(acked)
            }
        };

        Ok(Message {
            id: frame.id,
            sender,
            destination: frame.destination,
            ttl: frame.ttl,
            attempt: frame.attempt,
            kind,
        })
    }

    fn decode_bytes(payload: &Value) -> MeshResult<Vec<u8>> {
        let encoded = payload
            .as_str()
            .ok_or_else(|| MeshError::Codec("Byte payload must be a hex string".into()))?;
        hex::decode(encoded).map_err(|e| MeshError::Codec(format!("Invalid hex payload: {}", e)))
    }
}
