//! BitChat Mesh - peer-to-peer mesh coordination
//!
//! Runs BitChat mesh nodes over an abstract link layer: peer lifecycle and
//! liveness, distance-vector routing, multi-hop forwarding with TTL and
//! duplicate suppression, and acknowledged delivery of direct messages.
//!
//! ```no_run
//! use bitchat_mesh::{MeshConfig, MeshCoordinator, PeerId, SimulatedNetwork};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let network = SimulatedNetwork::new();
//! let alice = MeshCoordinator::new(network.attach("alice")?, MeshConfig::default())?;
//! let bob = MeshCoordinator::new(network.attach("bob")?, MeshConfig::default())?;
//! network.connect(alice.local_id(), bob.local_id());
//!
//! bob.on_message_delivered(|message| println!("bob got {:?}", message.text_content()));
//! tokio::try_join!(alice.connect(), bob.connect())?;
//! alice.send_text(PeerId::from("bob"), "hello").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod link;
pub mod mesh;
pub mod message;

pub use config::MeshConfig;
pub use error::{MeshError, MeshResult};
pub use link::{LinkLayer, SimulatedLink, SimulatedNetwork};
pub use mesh::{ConnectionState, MeshCoordinator, MeshEvent, Peer, PeerStatus};
pub use message::{Destination, Message, MessageId, MessageType, PeerId, RouteEntry, SystemNotice};
