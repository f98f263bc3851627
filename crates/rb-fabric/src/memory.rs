//! In-process fabric hub.
//!
//! All `MemoryFabric` handles created from the same hub deliver to each
//! other, which lets tests (and single-machine deployments) run several bus
//! instances against a real relay path without external infrastructure.

use crate::{FabricBackend, FabricError, FabricMessage, FabricSubscription};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

const TOPIC_CHANNEL_CAP: usize = 1024;
const SUBSCRIPTION_CAP: usize = 256;

/// Shared state between all handles of one hub.
struct Hub {
    topics: Mutex<HashMap<String, broadcast::Sender<FabricMessage>>>,
    next_id: AtomicU64,
}

impl Hub {
    async fn sender_for(&self, topic: &str) -> broadcast::Sender<FabricMessage> {
        let mut topics = self.topics.lock().await;
        topics
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(TOPIC_CHANNEL_CAP).0)
            .clone()
    }
}

/// One instance's handle onto a shared in-memory hub.
pub struct MemoryFabric {
    hub: Arc<Hub>,
    forwarders: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl MemoryFabric {
    /// A fresh hub with this handle as its first member.
    pub fn new() -> Self {
        MemoryFabric {
            hub: Arc::new(Hub {
                topics: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
            forwarders: Mutex::new(HashMap::new()),
        }
    }

    /// Another handle onto the same hub, for a peer instance.
    pub fn peer(&self) -> Self {
        MemoryFabric {
            hub: Arc::clone(&self.hub),
            forwarders: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryFabric {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FabricBackend for MemoryFabric {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<String, FabricError> {
        let sender = self.hub.sender_for(topic).await;
        let id = self.hub.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        // No subscribers anywhere is not an error; the event simply expires.
        let _ = sender.send(FabricMessage {
            id: id.clone(),
            payload: payload.to_vec(),
        });
        Ok(id)
    }

    async fn subscribe(&self, topic: &str) -> Result<FabricSubscription, FabricError> {
        let mut rx = self.hub.sender_for(topic).await.subscribe();
        let (tx, receiver) = mpsc::channel(SUBSCRIPTION_CAP);

        let topic_name = topic.to_owned();
        let forwarder = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(topic = %topic_name, dropped = n, "fabric subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let mut forwarders = self.forwarders.lock().await;
        if let Some(previous) = forwarders.insert(topic.to_owned(), forwarder) {
            previous.abort();
        }
        Ok(FabricSubscription { receiver })
    }

    async fn unsubscribe(&self, topic: &str) {
        if let Some(forwarder) = self.forwarders.lock().await.remove(topic) {
            forwarder.abort();
        }
    }

    async fn health_check(&self) -> Result<(), FabricError> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
