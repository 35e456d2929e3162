// Messaging layer
//
// This module implements the messaging layer for cycle consensus.
// It provides:
// - A point-to-point `Transport` seam (send / request over bytes)
// - `Comms`: recipient-bound authentication, `tell`/`ask`, gossip fan-out
// - Gossip suppression caches and recipient selection
// - An in-process transport for tests and simulation

use async_trait::async_trait;

pub mod comms;
pub mod gossip;
pub mod memory;
pub mod types;

#[cfg(test)]
mod integration_tests;

pub use comms::{Comms, Verified};
pub use gossip::{GossipCache, GossipConfig, GossipStats, ReceiveOutcome};
pub use memory::{MemoryHub, MemoryTransport};
pub use types::{
    Envelope, GossipPayload, GossipType, InboundMessage, Node, NodeId, NodeStatus, Route,
};

/// Network error types
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Failed to send message: {0}")]
    SendError(String),
    #[error("Peer not found: {0}")]
    PeerNotFound(NodeId),
    #[error("Peer disconnected: {0}")]
    Disconnected(NodeId),
    #[error("Response dropped by {0}")]
    ResponseDropped(NodeId),
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Reliable point-to-point primitive the messaging layer is built on.
///
/// Implementations only move bytes; authentication, tracking and gossip
/// semantics live in `Comms`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fire-and-forget delivery
    async fn send(&self, to: &NodeId, route: Route, body: Vec<u8>) -> NetworkResult<()>;

    /// Single round trip
    async fn request(&self, to: &NodeId, route: Route, body: Vec<u8>) -> NetworkResult<Vec<u8>>;
}
