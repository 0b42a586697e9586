//! Mesh Coordinator
//!
//! Facade the chat front end and the transport talk to. Drives the
//! DISCONNECTED -> JOINING -> CONNECTED -> LEAVING -> DISCONNECTED lifecycle
//! and owns the background tasks of one node: inbound processing, route
//! advertisement, discovery beacons, liveness and reliability sweeps.

use anyhow::{bail, Result};
use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use super::events::{MeshEvent, MeshEvents};
use super::peer_registry::Peer;
use crate::config::MeshConfig;
use crate::error::{MeshError, MeshResult};
use crate::link::LinkLayer;
use crate::message::dispatcher::MessageDispatcher;
use crate::message::message_types::{Destination, Message, MessageId, PeerId, SystemNotice};
use crate::message::routing_table::RouteEntry;

/// Lifecycle state of a mesh node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Joining,
    Connected,
    Leaving,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Joining => "JOINING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Leaving => "LEAVING",
        };
        f.write_str(name)
    }
}

/// One mesh node running over a link layer
#[derive(Clone)]
pub struct MeshCoordinator {
    local_id: PeerId,
    config: MeshConfig,
    link: Arc<dyn LinkLayer>,
    events: Arc<MeshEvents>,
    dispatcher: Arc<MessageDispatcher>,
    state: Arc<RwLock<ConnectionState>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl MeshCoordinator {
    pub fn new(link: Arc<dyn LinkLayer>, config: MeshConfig) -> MeshResult<Self> {
        config.validate()?;
        // ids are embedded in message ids, so they must round-trip the codec
        let local_id = PeerId::new(link.local_id().as_str())?;

        let events = Arc::new(MeshEvents::new());
        let dispatcher = Arc::new(MessageDispatcher::new(
            link.clone(),
            config.clone(),
            events.clone(),
        ));

        Ok(Self {
            local_id,
            config,
            link,
            events,
            dispatcher,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Join the mesh: announce, collect replies for the discovery window,
    /// then start the periodic tasks
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                ConnectionState::Connected | ConnectionState::Joining => return Ok(()),
                ConnectionState::Leaving => bail!("Cannot connect while leaving the mesh"),
                ConnectionState::Disconnected => *state = ConnectionState::Joining,
            }
        }
        self.events.state_changed(ConnectionState::Joining);
        info!("Joining mesh as {}", self.local_id);

        self.start_inbound_processing().await;

        let reached = self.dispatcher.announce();
        debug!("Discovery beacon heard by {} peer(s)", reached);
        time::sleep(self.config.discovery_window()).await;

        {
            let mut state = self.state.write().await;
            if *state != ConnectionState::Joining {
                bail!("Join interrupted (state: {})", *state);
            }
            *state = ConnectionState::Connected;
        }

        self.start_background_tasks().await;
        self.dispatcher.advertise_routes();
        self.events.state_changed(ConnectionState::Connected);

        info!(
            "Connected to mesh with {} neighbor(s)",
            self.dispatcher.routing_neighbors().len()
        );
        Ok(())
    }

    /// Leave the mesh: stop all tasks, abandon pending acknowledgments and
    /// tell the neighbors
    pub async fn disconnect(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                ConnectionState::Disconnected | ConnectionState::Leaving => return Ok(()),
                _ => *state = ConnectionState::Leaving,
            }
        }
        self.events.state_changed(ConnectionState::Leaving);
        info!("Leaving mesh");

        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }

        for message_id in self.dispatcher.reliability().abandon_all() {
            self.dispatcher.report_delivery_failure(&message_id);
        }

        match self.dispatcher.notify_leaving() {
            Ok(notified) => debug!("Notified {} neighbor(s) of departure", notified),
            Err(e) => warn!("Failed to notify neighbors of departure: {}", e),
        }

        self.link.clear_receiver();
        self.dispatcher.reset();

        *self.state.write().await = ConnectionState::Disconnected;
        self.events.state_changed(ConnectionState::Disconnected);
        self.events.peer_list_changed(Vec::new());

        info!("Disconnected from mesh");
        Ok(())
    }

    /// Send text with the default TTL
    pub async fn send_text(
        &self,
        destination: impl Into<Destination>,
        text: &str,
    ) -> MeshResult<MessageId> {
        self.send_text_with_ttl(destination, text, self.config.default_ttl)
            .await
    }

    /// Send text to one peer or to everyone. Unicast messages are tracked
    /// until acknowledged.
    pub async fn send_text_with_ttl(
        &self,
        destination: impl Into<Destination>,
        text: &str,
        ttl: u8,
    ) -> MeshResult<MessageId> {
        let state = *self.state.read().await;
        if state != ConnectionState::Connected {
            return Err(MeshError::NotConnected {
                state: state.to_string(),
            });
        }

        let destination = destination.into();
        let message = Message::text(
            self.dispatcher.next_id(),
            self.local_id.clone(),
            destination.clone(),
            ttl,
            text,
        );
        let message_id = message.id.clone();

        let tracked = matches!(&destination, Destination::Peer(peer_id) if *peer_id != self.local_id);
        if tracked {
            self.dispatcher.reliability().track_outbound(message.clone());
        }

        match self.dispatcher.originate(&message) {
            Ok(()) => {
                debug!("Sent {} to {}", message_id, destination);
                Ok(message_id)
            }
            Err(MeshError::LinkUnavailable { peer_id }) => {
                // Still tracked; the reliability sweep retries it
                debug!("Link to {} unavailable, {} will be retried", peer_id, message_id);
                Ok(message_id)
            }
            Err(e) => {
                if tracked {
                    self.dispatcher.reliability().cancel(&message_id);
                }
                if let (MeshError::RouteNotFound { .. }, Destination::Peer(peer_id)) = (&e, &destination) {
                    self.dispatcher.deliver_notice(&SystemNotice::Unreachable {
                        message_id: message_id.clone(),
                        destination: peer_id.clone(),
                    });
                }
                debug!("Send of {} failed: {}", message_id, e);
                Err(e)
            }
        }
    }

    pub fn on_message_delivered<F>(&self, callback: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.events.on_message_delivered(Arc::new(callback));
    }

    pub fn on_peer_list_changed<F>(&self, callback: F)
    where
        F: Fn(&[Peer]) + Send + Sync + 'static,
    {
        self.events.on_peer_list_changed(Arc::new(callback));
    }

    pub fn on_delivery_failed<F>(&self, callback: F)
    where
        F: Fn(&MessageId) + Send + Sync + 'static,
    {
        self.events.on_delivery_failed(Arc::new(callback));
    }

    /// Stream of all mesh events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    pub fn list_peers(&self) -> Vec<Peer> {
        self.dispatcher.peers().list_peers()
    }

    pub fn best_route(&self, destination: &PeerId) -> Option<RouteEntry> {
        self.dispatcher.best_route(destination)
    }

    pub fn routes(&self) -> Vec<RouteEntry> {
        self.dispatcher.route_snapshot()
    }

    pub fn pending_acknowledgments(&self) -> usize {
        self.dispatcher.reliability().pending_count()
    }

    pub fn dispatcher(&self) -> &MessageDispatcher {
        &self.dispatcher
    }

    /// Get node status
    pub async fn get_status(&self) -> Value {
        let state = self.state().await;
        serde_json::json!({
            "peer_id": self.local_id.to_string(),
            "state": state,
            "peers": self.list_peers(),
            "routing_table": self.routes(),
            "pending_acks": self.pending_acknowledgments(),
            "message_count": self.dispatcher.stats().delivered,
        })
    }

    /// Get dispatch statistics
    pub async fn get_statistics(&self) -> Value {
        let state = self.state().await;
        serde_json::json!({
            "state": state,
            "dispatch": self.dispatcher.get_statistics(),
        })
    }

    /// Feed link callbacks into a single task so messages from one link are
    /// handled in arrival order
    async fn start_inbound_processing(&self) {
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<(Message, PeerId)>();
        self.link.on_receive(Arc::new(move |message: Message, from: PeerId| {
            if inbound_tx.send((message, from)).is_err() {
                debug!("Inbound queue closed, dropping frame");
            }
        }));

        let dispatcher = self.dispatcher.clone();
        let handle = tokio::spawn(async move {
            while let Some((message, from)) = inbound_rx.recv().await {
                dispatcher.handle_inbound(message, from);
            }
        });
        self.tasks.lock().await.push(handle);
    }

    async fn start_background_tasks(&self) {
        let advertise = self.spawn_periodic(self.config.advertise_interval(), true, |dispatcher| {
            dispatcher.advertise_routes();
        });
        let announce = self.spawn_periodic(self.config.announce_interval(), true, |dispatcher| {
            dispatcher.announce();
        });
        let liveness = self.spawn_periodic(self.config.liveness_sweep_interval(), false, |dispatcher| {
            dispatcher.sweep_liveness();
        });
        let reliability =
            self.spawn_periodic(self.config.reliability_sweep_interval(), false, |dispatcher| {
                dispatcher.sweep_reliability();
            });

        self.tasks
            .lock()
            .await
            .extend([advertise, announce, liveness, reliability]);
    }

    /// Run `job` every `period`. Jittered tasks start at a random offset so
    /// neighbors do not advertise in lockstep.
    fn spawn_periodic<F>(&self, period: Duration, jitter: bool, job: F) -> JoinHandle<()>
    where
        F: Fn(&MessageDispatcher) + Send + 'static,
    {
        let offset = if jitter {
            let max_ms = (period.as_millis() as u64 / 10).max(1);
            Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
        } else {
            Duration::ZERO
        };

        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period + offset, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                job(&*dispatcher);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::SimulatedNetwork;

    fn coordinator(network: &SimulatedNetwork, id: &str) -> MeshCoordinator {
        MeshCoordinator::new(network.attach(id).unwrap(), MeshConfig::default()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn send_requires_connected_state() {
        let network = SimulatedNetwork::new();
        let node = coordinator(&network, "a");

        let err = node.send_text(PeerId::from("b"), "hello").await.unwrap_err();
        assert!(matches!(err, MeshError::NotConnected { ref state } if state == "DISCONNECTED"));
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_emits_state_changes() {
        let network = SimulatedNetwork::new();
        let node = coordinator(&network, "a");
        let mut events = node.subscribe();

        node.connect().await.unwrap();
        assert_eq!(node.state().await, ConnectionState::Connected);
        node.connect().await.unwrap();

        node.disconnect().await.unwrap();
        assert_eq!(node.state().await, ConnectionState::Disconnected);
        assert!(node.tasks.lock().await.is_empty());

        let states: Vec<ConnectionState> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|event| match event {
                MeshEvent::StateChanged(state) => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Joining,
                ConnectionState::Connected,
                ConnectionState::Leaving,
                ConnectionState::Disconnected,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn isolated_node_reports_route_not_found() {
        let network = SimulatedNetwork::new();
        let node = coordinator(&network, "a");
        let notices = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = notices.clone();
        node.on_message_delivered(move |message| {
            if let Some(notice) = message.system_notice() {
                sink.lock().push(notice);
            }
        });
        node.connect().await.unwrap();

        let err = node.send_text(PeerId::from("z"), "anyone?").await.unwrap_err();
        assert!(matches!(err, MeshError::RouteNotFound { .. }));
        assert_eq!(node.pending_acknowledgments(), 0);
        assert!(matches!(notices.lock().as_slice(), [SystemNotice::Unreachable { .. }]));

        // broadcasts need no route
        assert!(node.send_text(Destination::Broadcast, "hello?").await.is_ok());
        node.disconnect().await.unwrap();
    }

    #[test]
    fn rejects_invalid_config() {
        let network = SimulatedNetwork::new();
        let config = MeshConfig {
            default_ttl: 0,
            ..MeshConfig::default()
        };
        assert!(MeshCoordinator::new(network.attach("a").unwrap(), config).is_err());
    }

    /// Link layer reporting an id the codec could never decode
    struct MisnamedLink;

    impl LinkLayer for MisnamedLink {
        fn local_id(&self) -> PeerId {
            PeerId::from("node#1")
        }

        fn send(&self, _to: &PeerId, _message: &Message) -> bool {
            false
        }

        fn broadcast(&self, _message: &Message) -> usize {
            0
        }

        fn on_receive(&self, _handler: crate::link::InboundHandler) {}

        fn clear_receiver(&self) {}
    }

    #[test]
    fn rejects_link_with_invalid_local_id() {
        let result = MeshCoordinator::new(Arc::new(MisnamedLink), MeshConfig::default());
        assert!(matches!(result, Err(MeshError::InvalidState(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_state_and_peers() {
        let network = SimulatedNetwork::new();
        let node = coordinator(&network, "a");
        node.connect().await.unwrap();

        let status = node.get_status().await;
        assert_eq!(status["state"], "CONNECTED");
        assert_eq!(status["peer_id"], "a");
        assert!(status["peers"].as_array().unwrap().is_empty());

        let stats = node.get_statistics().await;
        assert_eq!(stats["dispatch"]["counters"]["delivered"], 0);
        node.disconnect().await.unwrap();
    }
}
