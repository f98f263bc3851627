//! Presence store: per-topic keyed presence metadata with diff emission.
//!
//! Entries owned by local connections come from `presence` frames; entries
//! owned by remote instances arrive over the fabric and keep the presence
//! ref the origin allocated, so refs stay stable cluster-wide.

use rb_protocol::{PresenceDiff, PresenceEntry, PresenceMap, limits};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::state::ConnId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PresenceOwner {
    Local(ConnId),
    Remote(Uuid),
}

#[derive(Clone, Debug)]
struct StoredPresence {
    presence_ref: String,
    meta: Value,
    owner: PresenceOwner,
}

impl StoredPresence {
    fn wire_entry(&self) -> PresenceEntry {
        PresenceEntry {
            presence_ref: self.presence_ref.clone(),
            meta: self.meta.clone(),
        }
    }
}

#[derive(Debug)]
pub struct TrackOutcome {
    pub presence_ref: String,
    pub diff: PresenceDiff,
}

/// Presence removals caused by one connection closing, grouped per topic.
#[derive(Debug)]
pub struct DisconnectCleanup {
    pub topic: String,
    pub diff: PresenceDiff,
    /// (key, presence_ref) pairs removed, for fabric untrack publication.
    pub removed: Vec<(String, String)>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum TrackError {
    LimitReached,
}

pub struct PresenceStore {
    topics: RwLock<HashMap<String, HashMap<String, Vec<StoredPresence>>>>,
}

impl PresenceStore {
    pub fn new() -> Self {
        PresenceStore {
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Upsert a presence under (owner, key).  A re-track by the same owner
    /// updates the meta in place and keeps the presence ref; a first track
    /// allocates a fresh ref.  The returned diff carries the resulting entry
    /// under `joins`.
    pub async fn track(
        &self,
        topic: &str,
        key: &str,
        owner: PresenceOwner,
        meta: Value,
    ) -> Result<TrackOutcome, TrackError> {
        let mut topics = self.topics.write().await;
        let keys = topics.entry(topic.to_owned()).or_default();

        let existing = keys
            .get_mut(key)
            .and_then(|list| list.iter_mut().find(|p| p.owner == owner));
        let entry = match existing {
            Some(stored) => {
                stored.meta = meta;
                stored.wire_entry()
            }
            None => {
                let entry_count: usize = keys.values().map(Vec::len).sum();
                if entry_count >= limits::MAX_PRESENCE_PER_CHANNEL {
                    return Err(TrackError::LimitReached);
                }
                let stored = StoredPresence {
                    presence_ref: Uuid::new_v4().to_string(),
                    meta,
                    owner,
                };
                let entry = stored.wire_entry();
                keys.entry(key.to_owned()).or_default().push(stored);
                entry
            }
        };

        let presence_ref = entry.presence_ref.clone();
        let mut joins = PresenceMap::new();
        joins.insert(key.to_owned(), vec![entry]);
        Ok(TrackOutcome {
            presence_ref,
            diff: PresenceDiff {
                joins,
                ..Default::default()
            },
        })
    }

    /// Apply a track relayed from another instance, upserting by presence
    /// ref so re-tracks update rather than duplicate.
    pub async fn apply_remote_track(
        &self,
        topic: &str,
        key: &str,
        presence_ref: &str,
        origin: Uuid,
        meta: Value,
    ) -> PresenceDiff {
        let mut topics = self.topics.write().await;
        let keys = topics.entry(topic.to_owned()).or_default();
        let list = keys.entry(key.to_owned()).or_default();

        let entry = match list.iter_mut().find(|p| p.presence_ref == presence_ref) {
            Some(stored) => {
                stored.meta = meta;
                stored.wire_entry()
            }
            None => {
                let stored = StoredPresence {
                    presence_ref: presence_ref.to_owned(),
                    meta,
                    owner: PresenceOwner::Remote(origin),
                };
                let entry = stored.wire_entry();
                list.push(stored);
                entry
            }
        };

        let mut joins = PresenceMap::new();
        joins.insert(key.to_owned(), vec![entry]);
        PresenceDiff {
            joins,
            ..Default::default()
        }
    }

    /// Remove the presence under (owner, key).  `None` when nothing was
    /// tracked — untrack is a no-op then.
    pub async fn untrack(
        &self,
        topic: &str,
        key: &str,
        owner: &PresenceOwner,
    ) -> Option<PresenceDiff> {
        let mut topics = self.topics.write().await;
        let keys = topics.get_mut(topic)?;
        let list = keys.get_mut(key)?;
        let index = list.iter().position(|p| &p.owner == owner)?;
        let removed = list.remove(index);
        if list.is_empty() {
            keys.remove(key);
        }
        if keys.is_empty() {
            topics.remove(topic);
        }

        let mut leaves = PresenceMap::new();
        leaves.insert(key.to_owned(), vec![removed.wire_entry()]);
        Some(PresenceDiff {
            leaves,
            ..Default::default()
        })
    }

    /// Remove a relayed presence by its ref (remote untrack or remote
    /// disconnect cleanup).
    pub async fn remove_ref(
        &self,
        topic: &str,
        key: &str,
        presence_ref: &str,
    ) -> Option<PresenceDiff> {
        let mut topics = self.topics.write().await;
        let keys = topics.get_mut(topic)?;
        let list = keys.get_mut(key)?;
        let index = list.iter().position(|p| p.presence_ref == presence_ref)?;
        let removed = list.remove(index);
        if list.is_empty() {
            keys.remove(key);
        }
        if keys.is_empty() {
            topics.remove(topic);
        }

        let mut leaves = PresenceMap::new();
        leaves.insert(key.to_owned(), vec![removed.wire_entry()]);
        Some(PresenceDiff {
            leaves,
            ..Default::default()
        })
    }

    /// Remove every presence owned by a closing connection, across all
    /// topics, producing one leave diff per affected topic.
    pub async fn remove_owner(&self, owner: &PresenceOwner) -> Vec<DisconnectCleanup> {
        let mut topics = self.topics.write().await;
        let mut cleanups = Vec::new();

        topics.retain(|topic, keys| {
            let mut leaves = PresenceMap::new();
            let mut removed = Vec::new();
            keys.retain(|key, list| {
                let mut kept = Vec::with_capacity(list.len());
                for stored in list.drain(..) {
                    if &stored.owner == owner {
                        removed.push((key.clone(), stored.presence_ref.clone()));
                        leaves
                            .entry(key.clone())
                            .or_default()
                            .push(stored.wire_entry());
                    } else {
                        kept.push(stored);
                    }
                }
                *list = kept;
                !list.is_empty()
            });
            if !leaves.is_empty() {
                cleanups.push(DisconnectCleanup {
                    topic: topic.clone(),
                    diff: PresenceDiff {
                        leaves,
                        ..Default::default()
                    },
                    removed,
                });
            }
            !keys.is_empty()
        });

        cleanups
    }

    /// Authoritative snapshot of a topic's presence, owners stripped.
    pub async fn snapshot(&self, topic: &str) -> PresenceMap {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|keys| {
                keys.iter()
                    .map(|(key, list)| {
                        (
                            key.clone(),
                            list.iter().map(StoredPresence::wire_entry).collect(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop a topic's entries wholesale, used when the last local member is
    /// gone and the shadow of remote entries no longer has an audience.
    pub async fn clear_topic(&self, topic: &str) {
        self.topics.write().await.remove(topic);
    }
}

impl Default for PresenceStore {
    fn default() -> Self {
        Self::new()
    }
}
