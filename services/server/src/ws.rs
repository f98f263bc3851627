//! WebSocket link handling.
//!
//! One connection gets one writer task draining its outbox, so all frames
//! to a link are written sequentially, and one read loop handling inbound
//! frames in arrival order.  Undecodable frames are logged and dropped;
//! they never close the link.

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use rb_protocol::Frame;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::presence::PresenceOwner;
use crate::router::{self, ConnContext};
use crate::state::{AppState, ConnInfo, Outbox};
use crate::wire;

const OUTBOX_CAP: usize = 256;

/// Links silent for this long are dropped: three missed heartbeat intervals
/// at the default 25 s client cadence.
const SESSION_TIMEOUT: Duration = Duration::from_secs(75);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Identity reported in channel member listings.  Defaults to the
    /// connection id.
    client_id: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.client_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, client_id: Option<String>) {
    let conn_id = Uuid::new_v4();
    let client_id = client_id.unwrap_or_else(|| conn_id.to_string());
    let (mut sender, mut receiver) = socket.split();

    let (outbox_tx, mut outbox_rx) = mpsc::channel::<Message>(OUTBOX_CAP);
    let outbox = Outbox::new(conn_id, outbox_tx);

    let writer = tokio::spawn(async move {
        while let Some(msg) = outbox_rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    state
        .register_conn(
            conn_id,
            ConnInfo {
                client_id: client_id.clone(),
                outbox: outbox.clone(),
            },
        )
        .await;
    info!(conn_id = %conn_id, client_id = %client_id, "client connected");

    let mut ctx = ConnContext::new(conn_id, client_id.clone(), outbox.clone());
    loop {
        let msg = match tokio::time::timeout(SESSION_TIMEOUT, receiver.next()).await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(_) => {
                warn!(conn_id = %conn_id, "session timeout, dropping silent link");
                break;
            }
        };
        match msg {
            Ok(Message::Text(text)) => match Frame::decode(&text) {
                Ok(frame) => router::handle_frame(&state, &mut ctx, frame, text.len()).await,
                Err(e) => {
                    debug!(conn_id = %conn_id, error = %e, "dropping undecodable frame");
                }
            },
            Ok(Message::Ping(data)) => {
                outbox.send_message(Message::Pong(data));
            }
            Ok(Message::Close(_)) => {
                debug!(conn_id = %conn_id, "close frame received");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(conn_id = %conn_id, error = %e, "link error");
                break;
            }
        }
    }

    cleanup(&state, conn_id).await;
    writer.abort();
    info!(conn_id = %conn_id, client_id = %client_id, "client disconnected");
}

/// Tear down everything a closed link owned: memberships, presence entries
/// (with leave diffs to remaining peers and untrack relays to the fabric),
/// and fabric subscriptions for topics it emptied.
async fn cleanup(state: &AppState, conn_id: Uuid) {
    let topics_left = state.channels.remove_conn(conn_id).await;

    let owner = PresenceOwner::Local(conn_id);
    for cleanup in state.presence.remove_owner(&owner).await {
        if let Some(text) = wire::presence_diff_text(&cleanup.topic, &cleanup.diff) {
            state.channels.fan_out(&cleanup.topic, &text, None).await;
        }
        if let Some(fabric) = &state.fabric {
            for (key, presence_ref) in &cleanup.removed {
                fabric
                    .publish_untrack(&cleanup.topic, key, presence_ref)
                    .await;
            }
        }
    }

    for (topic, emptied) in topics_left {
        if emptied {
            state.presence.clear_topic(&topic).await;
            if let Some(fabric) = &state.fabric {
                fabric.release(&topic).await;
            }
        }
    }

    state.unregister_conn(conn_id).await;
}
