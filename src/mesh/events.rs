//! Mesh Events
//!
//! Notifications for the chat front end, delivered two ways: registered
//! callbacks and a tokio broadcast stream for async consumers.

use log::debug;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::coordinator::ConnectionState;
use super::peer_registry::Peer;
use crate::message::message_types::{Message, MessageId};

/// Default number of buffered events per subscriber
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// TEXT or SYSTEM message delivered to this node
    MessageDelivered(Message),
    PeerListChanged(Vec<Peer>),
    /// Retries exhausted without an acknowledgment
    DeliveryFailed(MessageId),
    DeliveryConfirmed(MessageId),
    StateChanged(ConnectionState),
}

pub type MessageCallback = Arc<dyn Fn(&Message) + Send + Sync>;
pub type PeerListCallback = Arc<dyn Fn(&[Peer]) + Send + Sync>;
pub type DeliveryFailedCallback = Arc<dyn Fn(&MessageId) + Send + Sync>;

pub struct MeshEvents {
    delivered: RwLock<Vec<MessageCallback>>,
    peers_changed: RwLock<Vec<PeerListCallback>>,
    delivery_failed: RwLock<Vec<DeliveryFailedCallback>>,
    tx: broadcast::Sender<MeshEvent>,
}

impl MeshEvents {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            delivered: RwLock::new(Vec::new()),
            peers_changed: RwLock::new(Vec::new()),
            delivery_failed: RwLock::new(Vec::new()),
            tx,
        }
    }

    pub fn on_message_delivered(&self, callback: MessageCallback) {
        self.delivered.write().push(callback);
    }

    pub fn on_peer_list_changed(&self, callback: PeerListCallback) {
        self.peers_changed.write().push(callback);
    }

    pub fn on_delivery_failed(&self, callback: DeliveryFailedCallback) {
        self.delivery_failed.write().push(callback);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    // Callbacks are cloned out first so none runs under the lock

    pub fn message_delivered(&self, message: &Message) {
        let callbacks = self.delivered.read().clone();
        for callback in callbacks {
            callback(message);
        }
        self.emit(MeshEvent::MessageDelivered(message.clone()));
    }

    pub fn peer_list_changed(&self, peers: Vec<Peer>) {
        let callbacks = self.peers_changed.read().clone();
        for callback in callbacks {
            callback(&peers);
        }
        self.emit(MeshEvent::PeerListChanged(peers));
    }

    pub fn delivery_failed(&self, message_id: &MessageId) {
        let callbacks = self.delivery_failed.read().clone();
        for callback in callbacks {
            callback(message_id);
        }
        self.emit(MeshEvent::DeliveryFailed(message_id.clone()));
    }

    pub fn delivery_confirmed(&self, message_id: &MessageId) {
        self.emit(MeshEvent::DeliveryConfirmed(message_id.clone()));
    }

    pub fn state_changed(&self, state: ConnectionState) {
        self.emit(MeshEvent::StateChanged(state));
    }

    fn emit(&self, event: MeshEvent) -> usize {
        match self.tx.send(event) {
            Ok(count) => count,
            Err(_) => {
                debug!("No event subscribers");
                0
            }
        }
    }
}

impl Default for MeshEvents {
    fn default() -> Self {
        Self::new()
    }
}
