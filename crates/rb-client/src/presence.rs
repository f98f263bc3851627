//! Client-side presence reconciliation.
//!
//! `presence_state` snapshots are authoritative and replace local state;
//! `presence_diff` frames mutate it.  Diffs apply leaves before joins,
//! subtracting and unioning by presence ref so multiple sessions under one
//! key merge cleanly.  A diff arriving before any snapshot applies against
//! empty state: diffs are self-sufficient for members that join after the
//! snapshot moment, and the server snapshots every joiner before relaying
//! peer diffs to it.

use rb_protocol::{PresenceDiff, PresenceEntry, PresenceMap};
use std::sync::{Arc, Mutex};

/// Which presence callback a listener binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceEvent {
    Sync,
    Join,
    Leave,
}

/// `(key, current entries after the change, entries joined or left)`
pub type PresenceCallback = Arc<dyn Fn(&str, &[PresenceEntry], &[PresenceEntry]) + Send + Sync>;
pub type SyncCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Listeners {
    sync: Vec<SyncCallback>,
    join: Vec<PresenceCallback>,
    leave: Vec<PresenceCallback>,
}

/// Reconciled presence state for one channel.
#[derive(Default)]
pub struct PresenceSync {
    state: Mutex<PresenceMap>,
    listeners: Mutex<Listeners>,
}

impl PresenceSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_sync(&self, cb: SyncCallback) {
        self.listeners.lock().expect("listeners lock").sync.push(cb);
    }

    pub fn on_join(&self, cb: PresenceCallback) {
        self.listeners.lock().expect("listeners lock").join.push(cb);
    }

    pub fn on_leave(&self, cb: PresenceCallback) {
        self.listeners.lock().expect("listeners lock").leave.push(cb);
    }

    /// Current reconciled state.
    pub fn state(&self) -> PresenceMap {
        self.state.lock().expect("presence lock").clone()
    }

    /// Reset local state from an authoritative snapshot and emit `sync`.
    pub fn apply_snapshot(&self, snapshot: PresenceMap) {
        *self.state.lock().expect("presence lock") = snapshot;
        self.emit_sync();
    }

    /// Apply a diff: leaves first, then joins, then one `sync`.
    pub fn apply_diff(&self, diff: &PresenceDiff) {
        // (key, state after the change, entries that changed)
        let mut left: Vec<(String, Vec<PresenceEntry>, Vec<PresenceEntry>)> = Vec::new();
        let mut joined: Vec<(String, Vec<PresenceEntry>, Vec<PresenceEntry>)> = Vec::new();

        {
            let mut state = self.state.lock().expect("presence lock");

            for (key, leaves) in &diff.leaves {
                let Some(list) = state.get_mut(key) else {
                    continue;
                };
                let before = list.len();
                list.retain(|entry| {
                    !leaves
                        .iter()
                        .any(|leave| leave.presence_ref == entry.presence_ref)
                });
                if list.len() == before {
                    continue;
                }
                let current = list.clone();
                if list.is_empty() {
                    state.remove(key);
                }
                left.push((key.clone(), current, leaves.clone()));
            }

            for (key, joins) in &diff.joins {
                let list = state.entry(key.clone()).or_default();
                let mut new_entries = Vec::new();
                for join in joins {
                    match list
                        .iter_mut()
                        .find(|entry| entry.presence_ref == join.presence_ref)
                    {
                        Some(entry) => entry.meta = join.meta.clone(),
                        None => {
                            list.push(join.clone());
                        }
                    }
                    new_entries.push(join.clone());
                }
                joined.push((key.clone(), list.clone(), new_entries));
            }
        }

        let (sync_cbs, join_cbs, leave_cbs) = {
            let listeners = self.listeners.lock().expect("listeners lock");
            (
                listeners.sync.clone(),
                listeners.join.clone(),
                listeners.leave.clone(),
            )
        };
        for (key, current, leaves) in &left {
            for cb in &leave_cbs {
                cb(key, current, leaves);
            }
        }
        for (key, current, joins) in &joined {
            for cb in &join_cbs {
                cb(key, current, joins);
            }
        }
        for cb in &sync_cbs {
            cb();
        }
    }

    fn emit_sync(&self) {
        let sync_cbs = self.listeners.lock().expect("listeners lock").sync.clone();
        for cb in &sync_cbs {
            cb();
        }
    }
}
