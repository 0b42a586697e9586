//! Error types for mesh operations.
//!
//! Transient network conditions (link failure, missing route, duplicate,
//! exhausted TTL, stale advertisement) are handled where they occur and only
//! show up here so callers and tests can name them.

use thiserror::Error;

/// Errors produced by the mesh coordinator and its components.
#[derive(Debug, Error)]
pub enum MeshError {
    /// A send to a direct neighbor failed at the link layer
    #[error("Link to peer {peer_id} is unavailable")]
    LinkUnavailable { peer_id: String },

    /// No known path to the destination
    #[error("No route found to destination: {destination}")]
    RouteNotFound { destination: String },

    /// Message id already seen; dropped without further processing
    #[error("Duplicate message: {message_id}")]
    DuplicateMessage { message_id: String },

    /// Hop budget used up before the destination was reached
    #[error("TTL exhausted for message {message_id}")]
    TtlExhausted { message_id: String },

    /// No acknowledgment after all retries
    #[error("Delivery timed out for message {message_id}")]
    DeliveryTimeout { message_id: String },

    /// Route advertisement older than one already applied
    #[error("Stale route advertisement from {from} (sequence {sequence})")]
    StaleAdvertisement { from: String, sequence: u64 },

    /// Operation requires the CONNECTED state
    #[error("Mesh is not connected (state: {state})")]
    NotConnected { state: String },

    /// Invalid state transition or argument
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Wire format errors
    #[error("Codec error: {0}")]
    Codec(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MeshError {
    /// Whether this error only describes a transient network condition.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MeshError::LinkUnavailable { .. }
                | MeshError::RouteNotFound { .. }
                | MeshError::DuplicateMessage { .. }
                | MeshError::TtlExhausted { .. }
                | MeshError::StaleAdvertisement { .. }
        )
    }
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;
