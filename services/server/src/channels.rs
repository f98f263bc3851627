//! Channel registry: membership per topic and broadcast fan-out.

use rb_protocol::{ChannelConfig, limits};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::state::{ConnId, Outbox};

/// One connection's membership in a topic.
#[derive(Clone)]
pub struct ChannelMember {
    pub outbox: Outbox,
    pub client_id: String,
    /// Sequence of the `chan:join` that created this membership.
    pub join_seq: Option<String>,
    pub config: ChannelConfig,
}

#[derive(Default)]
struct TopicChannel {
    members: HashMap<ConnId, ChannelMember>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum JoinError {
    AlreadyJoined,
    ChannelFull,
    SubscriptionLimit,
}

/// Outcome of removing one membership.
pub struct LeaveOutcome {
    pub removed: bool,
    /// True when the topic has no local members left and was dropped.
    pub emptied: bool,
}

pub struct ChannelRegistry {
    topics: RwLock<HashMap<String, TopicChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        ChannelRegistry {
            topics: RwLock::new(HashMap::new()),
        }
    }

    pub async fn join(
        &self,
        topic: &str,
        conn_id: ConnId,
        member: ChannelMember,
    ) -> Result<(), JoinError> {
        let mut topics = self.topics.write().await;

        let subscriptions = topics
            .values()
            .filter(|t| t.members.contains_key(&conn_id))
            .count();
        if subscriptions >= limits::MAX_SUBSCRIPTIONS_PER_CONN {
            return Err(JoinError::SubscriptionLimit);
        }

        let channel = topics.entry(topic.to_owned()).or_default();
        if channel.members.contains_key(&conn_id) {
            return Err(JoinError::AlreadyJoined);
        }
        if channel.members.len() >= limits::MAX_MEMBERS_PER_CHANNEL {
            return Err(JoinError::ChannelFull);
        }
        channel.members.insert(conn_id, member);
        Ok(())
    }

    pub async fn leave(&self, topic: &str, conn_id: ConnId) -> LeaveOutcome {
        let mut topics = self.topics.write().await;
        let Some(channel) = topics.get_mut(topic) else {
            return LeaveOutcome {
                removed: false,
                emptied: false,
            };
        };
        let removed = channel.members.remove(&conn_id).is_some();
        let emptied = removed && channel.members.is_empty();
        if emptied {
            topics.remove(topic);
        }
        LeaveOutcome { removed, emptied }
    }

    /// Drop every membership of a closed connection.  Returns the topics it
    /// left, with the emptied flag per topic.
    pub async fn remove_conn(&self, conn_id: ConnId) -> Vec<(String, bool)> {
        let mut topics = self.topics.write().await;
        let mut left = Vec::new();
        topics.retain(|topic, channel| {
            if channel.members.remove(&conn_id).is_none() {
                return true;
            }
            let emptied = channel.members.is_empty();
            left.push((topic.clone(), emptied));
            !emptied
        });
        left
    }

    pub async fn member(&self, topic: &str, conn_id: ConnId) -> Option<ChannelMember> {
        self.topics
            .read()
            .await
            .get(topic)
            .and_then(|c| c.members.get(&conn_id))
            .cloned()
    }

    pub async fn is_member(&self, topic: &str, conn_id: ConnId) -> bool {
        self.topics
            .read()
            .await
            .get(topic)
            .is_some_and(|c| c.members.contains_key(&conn_id))
    }

    /// Write an already-encoded frame to every member, optionally skipping
    /// the sender.  The recipient set is the membership snapshot at call
    /// time; write failures are logged by the outbox and never abort the
    /// fan-out.  Returns the number of recipients targeted.
    pub async fn fan_out(&self, topic: &str, text: &str, skip: Option<ConnId>) -> usize {
        let outboxes: Vec<Outbox> = {
            let topics = self.topics.read().await;
            let Some(channel) = topics.get(topic) else {
                return 0;
            };
            channel
                .members
                .values()
                .filter(|m| Some(m.outbox.conn_id()) != skip)
                .map(|m| m.outbox.clone())
                .collect()
        };
        let count = outboxes.len();
        for outbox in outboxes {
            if !outbox.send_text(text) {
                debug!(topic = %topic, conn_id = %outbox.conn_id(), "fan-out write failed");
            }
        }
        count
    }

    pub async fn member_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map_or(0, |c| c.members.len())
    }

    pub async fn client_ids(&self, topic: &str) -> Vec<String> {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|c| c.members.values().map(|m| m.client_id.clone()).collect())
            .unwrap_or_default()
    }

    /// (channel count, total membership count) across all topics.
    pub async fn totals(&self) -> (usize, usize) {
        let topics = self.topics.read().await;
        let members = topics.values().map(|c| c.members.len()).sum();
        (topics.len(), members)
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
