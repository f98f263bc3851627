//! Cross-instance relay.
//!
//! Every channel-scoped mutation (broadcast, presence track/untrack) is
//! published to the fabric wrapped in a [`RelayEnvelope`] carrying the
//! origin instance id.  Each instance subscribes to the topics its local
//! members occupy and applies envelopes from *other* origins: broadcasts
//! fan out to all local members (the origin already served its own), and
//! presence mutations land in the local store under a remote owner.

use rb_fabric::FabricBackend;
use rb_protocol::BroadcastPayload;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::ChannelRegistry;
use crate::presence::PresenceStore;
use crate::wire;

/// Delay before a dropped topic subscription is retried.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub origin: Uuid,
    pub topic: String,
    #[serde(flatten)]
    pub body: RelayBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayBody {
    Broadcast {
        message: BroadcastPayload,
        sender: String,
    },
    PresenceTrack {
        key: String,
        presence_ref: String,
        meta: Value,
    },
    PresenceUntrack {
        key: String,
        presence_ref: String,
    },
}

pub struct FabricRelay {
    instance_id: Uuid,
    backend: Arc<dyn FabricBackend>,
    deliveries: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl FabricRelay {
    pub fn new(instance_id: Uuid, backend: Arc<dyn FabricBackend>) -> Self {
        FabricRelay {
            instance_id,
            backend,
            deliveries: Mutex::new(HashMap::new()),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub async fn publish_broadcast(&self, topic: &str, message: &BroadcastPayload, sender: &str) {
        self.publish(
            topic,
            RelayBody::Broadcast {
                message: message.clone(),
                sender: sender.to_owned(),
            },
        )
        .await;
    }

    pub async fn publish_track(&self, topic: &str, key: &str, presence_ref: &str, meta: Value) {
        self.publish(
            topic,
            RelayBody::PresenceTrack {
                key: key.to_owned(),
                presence_ref: presence_ref.to_owned(),
                meta,
            },
        )
        .await;
    }

    pub async fn publish_untrack(&self, topic: &str, key: &str, presence_ref: &str) {
        self.publish(
            topic,
            RelayBody::PresenceUntrack {
                key: key.to_owned(),
                presence_ref: presence_ref.to_owned(),
            },
        )
        .await;
    }

    /// Publish failures degrade to local-only delivery; the local fan-out
    /// has already happened by the time this is called.
    async fn publish(&self, topic: &str, body: RelayBody) {
        let envelope = RelayEnvelope {
            origin: self.instance_id,
            topic: topic.to_owned(),
            body,
        };
        let bytes = match serde_json::to_vec(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(topic = %topic, error = %e, "relay envelope failed to encode");
                return;
            }
        };
        if let Err(e) = self.backend.publish(topic, &bytes).await {
            warn!(topic = %topic, error = %e, "fabric publish failed");
        }
    }

    /// Start delivering fabric events for a topic into the local registries.
    /// Idempotent; the delivery task keeps resubscribing across outages
    /// until [`release`](Self::release) is called.
    pub async fn ensure_subscribed(
        self: &Arc<Self>,
        topic: &str,
        channels: Arc<ChannelRegistry>,
        presence: Arc<PresenceStore>,
    ) {
        let mut deliveries = self.deliveries.lock().await;
        if deliveries.contains_key(topic) {
            return;
        }

        let relay = Arc::clone(self);
        let topic_name = topic.to_owned();
        let task = tokio::spawn(async move {
            loop {
                match relay.backend.subscribe(&topic_name).await {
                    Ok(mut subscription) => {
                        info!(topic = %topic_name, "fabric subscription active");
                        while let Some(msg) = subscription.recv().await {
                            deliver(
                                relay.instance_id,
                                &channels,
                                &presence,
                                &msg.payload,
                            )
                            .await;
                        }
                        warn!(topic = %topic_name, "fabric subscription ended, retrying");
                    }
                    Err(e) => {
                        warn!(topic = %topic_name, error = %e, "fabric subscribe failed, retrying");
                    }
                }
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            }
        });
        deliveries.insert(topic.to_owned(), task);
    }

    /// Stop delivering for a topic (last local member left).  Idempotent.
    pub async fn release(&self, topic: &str) {
        if let Some(task) = self.deliveries.lock().await.remove(topic) {
            task.abort();
        }
        self.backend.unsubscribe(topic).await;
    }
}

/// Apply one fabric event to the local registries, dropping self-echoes.
async fn deliver(
    instance_id: Uuid,
    channels: &ChannelRegistry,
    presence: &PresenceStore,
    payload: &[u8],
) {
    let envelope: RelayEnvelope = match serde_json::from_slice(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(error = %e, "undecodable fabric event dropped");
            return;
        }
    };
    if envelope.origin == instance_id {
        return;
    }

    let topic = envelope.topic;
    match envelope.body {
        RelayBody::Broadcast { message, sender } => {
            debug!(topic = %topic, sender = %sender, "relaying remote broadcast");
            if let Some(text) = wire::broadcast_text(&topic, &message) {
                channels.fan_out(&topic, &text, None).await;
            }
        }
        RelayBody::PresenceTrack {
            key,
            presence_ref,
            meta,
        } => {
            let diff = presence
                .apply_remote_track(&topic, &key, &presence_ref, envelope.origin, meta)
                .await;
            if let Some(text) = wire::presence_diff_text(&topic, &diff) {
                channels.fan_out(&topic, &text, None).await;
            }
        }
        RelayBody::PresenceUntrack { key, presence_ref } => {
            if let Some(diff) = presence.remove_ref(&topic, &key, &presence_ref).await {
                if let Some(text) = wire::presence_diff_text(&topic, &diff) {
                    channels.fan_out(&topic, &text, None).await;
                }
            }
        }
    }
}
