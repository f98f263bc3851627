//! Pending-reply registry: correlates outstanding request sequences with
//! their one-shot completion sinks.
//!
//! Each slot is freed exactly once, by whichever comes first of the matching
//! reply, the deadline, or transport termination.  Replies arriving for a
//! freed slot are discarded silently.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Terminal outcome of one request.
#[derive(Debug)]
pub enum ReplyOutcome {
    Ok(Value),
    Error(Value),
    Timeout,
    /// The link closed while the request was in flight.
    Disconnected,
}

struct PendingEntry {
    tx: oneshot::Sender<ReplyOutcome>,
    deadline: JoinHandle<()>,
}

#[derive(Clone, Default)]
pub struct PendingReplies {
    entries: Arc<Mutex<HashMap<String, PendingEntry>>>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sequence and arm its deadline.  The returned receiver
    /// resolves with exactly one outcome.
    pub fn register(&self, seq: &str, timeout: Duration) -> oneshot::Receiver<ReplyOutcome> {
        let (tx, rx) = oneshot::channel();
        let entries = Arc::clone(&self.entries);
        let timeout_seq = seq.to_owned();
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let entry = entries.lock().expect("pending lock").remove(&timeout_seq);
            if let Some(entry) = entry {
                let _ = entry.tx.send(ReplyOutcome::Timeout);
            }
        });
        self.entries
            .lock()
            .expect("pending lock")
            .insert(seq.to_owned(), PendingEntry { tx, deadline });
        rx
    }

    /// Settle a sequence with its reply.  Returns false for unknown (late or
    /// never-registered) sequences, which callers discard.
    pub fn resolve(&self, seq: &str, outcome: ReplyOutcome) -> bool {
        let entry = self.entries.lock().expect("pending lock").remove(seq);
        match entry {
            Some(entry) => {
                entry.deadline.abort();
                let _ = entry.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding request, used on transport close.
    pub fn fail_all(&self) {
        let drained: Vec<PendingEntry> = {
            let mut entries = self.entries.lock().expect("pending lock");
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            entry.deadline.abort();
            let _ = entry.tx.send(ReplyOutcome::Disconnected);
        }
    }

    pub fn outstanding(&self) -> usize {
        self.entries.lock().expect("pending lock").len()
    }
}
