use axum::extract::ws::Message;
use rb_fabric::FabricBackend;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

use crate::auth::AuthVerifier;
use crate::channels::ChannelRegistry;
use crate::fabric_relay::FabricRelay;
use crate::presence::PresenceStore;

pub type ConnId = Uuid;

/// Write half of one link.  All frames to a connection go through its outbox
/// so writes stay serialized in the per-connection writer task.
#[derive(Clone, Debug)]
pub struct Outbox {
    conn_id: ConnId,
    tx: mpsc::Sender<Message>,
}

impl Outbox {
    pub fn new(conn_id: ConnId, tx: mpsc::Sender<Message>) -> Self {
        Outbox { conn_id, tx }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// Queue a text frame.  A full or closed outbox drops the frame; the
    /// connection's own lifecycle handles the dead link.
    pub fn send_text(&self, text: &str) -> bool {
        match self.tx.try_send(Message::Text(text.to_owned().into())) {
            Ok(()) => true,
            Err(e) => {
                debug!(conn_id = %self.conn_id, error = %e, "dropping frame for unwritable link");
                false
            }
        }
    }

    pub fn send_message(&self, msg: Message) -> bool {
        self.tx.try_send(msg).is_ok()
    }
}

#[derive(Clone)]
pub struct ConnInfo {
    pub client_id: String,
    pub outbox: Outbox,
}

#[derive(Clone)]
pub struct AppState {
    pub instance_id: Uuid,
    pub connections: Arc<RwLock<HashMap<ConnId, ConnInfo>>>,
    pub channels: Arc<ChannelRegistry>,
    pub presence: Arc<PresenceStore>,
    pub fabric: Option<Arc<FabricRelay>>,
    pub auth: Option<Arc<AuthVerifier>>,
}

impl AppState {
    pub fn new(auth: Option<AuthVerifier>) -> Self {
        Self::build(auth, None)
    }

    pub fn with_fabric(auth: Option<AuthVerifier>, backend: Arc<dyn FabricBackend>) -> Self {
        Self::build(auth, Some(backend))
    }

    fn build(auth: Option<AuthVerifier>, backend: Option<Arc<dyn FabricBackend>>) -> Self {
        let instance_id = Uuid::new_v4();
        AppState {
            instance_id,
            connections: Arc::new(RwLock::new(HashMap::new())),
            channels: Arc::new(ChannelRegistry::new()),
            presence: Arc::new(PresenceStore::new()),
            fabric: backend.map(|b| Arc::new(FabricRelay::new(instance_id, b))),
            auth: auth.map(Arc::new),
        }
    }

    pub async fn register_conn(&self, conn_id: ConnId, info: ConnInfo) {
        self.connections.write().await.insert(conn_id, info);
    }

    pub async fn unregister_conn(&self, conn_id: ConnId) {
        self.connections.write().await.remove(&conn_id);
    }

    pub async fn conn_count(&self) -> usize {
        self.connections.read().await.len()
    }
}
