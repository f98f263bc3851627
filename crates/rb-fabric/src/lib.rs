//! Fabric: the cross-instance relay transport.
//!
//! A bus instance publishes every channel-scoped event (broadcasts, presence
//! track/untrack) to a per-topic stream and subscribes to the topics its own
//! members occupy.  The contract is deliberately small so that very different
//! transports fit behind it:
//!
//! - [`memory::MemoryFabric`] — an in-process hub; instances sharing the hub
//!   see each other.  Used for single-machine runs and tests.
//! - [`redis::RedisFabric`] — one Redis stream per topic with bounded
//!   retention, polled on a short cadence, resuming from the last-seen id.
//!
//! Delivery is at-least-once; payloads are opaque bytes.  Origin filtering
//! (dropping an instance's own echoes) is the subscriber's concern, since the
//! origin id lives inside the payload envelope.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use memory::MemoryFabric;
pub use redis::RedisFabric;

/// One event delivered from a topic stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricMessage {
    /// Monotonic id assigned by the fabric, unique per stream.
    pub id: String,
    pub payload: Vec<u8>,
}

/// A live subscription to one topic.
///
/// Dropping the subscription releases the underlying consumer; the backend
/// notices the closed channel on its next delivery attempt.
pub struct FabricSubscription {
    pub receiver: mpsc::Receiver<FabricMessage>,
}

impl FabricSubscription {
    /// Next message in stream order, or `None` once the subscription ends.
    pub async fn recv(&mut self) -> Option<FabricMessage> {
        self.receiver.recv().await
    }
}

#[async_trait]
pub trait FabricBackend: Send + Sync {
    /// Append an event to the topic stream.  Returns the fabric-assigned id.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<String, FabricError>;

    /// Begin receiving events appended by any publisher of the topic.
    async fn subscribe(&self, topic: &str) -> Result<FabricSubscription, FabricError>;

    /// Release the subscription for a topic.  Idempotent.
    async fn unsubscribe(&self, topic: &str);

    /// Probe the backing transport.
    async fn health_check(&self) -> Result<(), FabricError>;

    fn backend_name(&self) -> &'static str;
}

#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    #[error("fabric backend: {0}")]
    Backend(String),
    #[error("fabric subscription closed")]
    Closed,
}

impl From<::redis::RedisError> for FabricError {
    fn from(e: ::redis::RedisError) -> Self {
        FabricError::Backend(e.to_string())
    }
}
