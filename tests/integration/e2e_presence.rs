//! End-to-end presence: snapshots on late join, diffs on track/untrack,
//! and the idempotence laws.

use rb_client::{Channel, SendStatus, Socket, SocketOptions};
use rb_protocol::{ChannelConfig, PresenceOptions};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn start_server() -> SocketAddr {
    let state = server::AppState::new(None);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, server::build_router(state))
            .await
            .unwrap();
    });
    addr
}

async fn presence_channel(addr: SocketAddr, client_id: &str, key: &str) -> (Socket, Arc<Channel>) {
    let socket = Socket::with_options(
        &format!("ws://{addr}/ws"),
        SocketOptions {
            client_id: Some(client_id.to_owned()),
            ..SocketOptions::default()
        },
    )
    .unwrap();
    socket.connect().await.unwrap();
    let channel = socket
        .channel(
            "room:3",
            ChannelConfig {
                presence: PresenceOptions {
                    key: Some(key.to_owned()),
                    enabled: true,
                },
                ..ChannelConfig::default()
            },
        )
        .await;
    (socket, channel)
}

/// Log of presence callbacks in firing order.
fn record_events(channel: &Arc<Channel>) -> Arc<Mutex<Vec<String>>> {
    let log = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&log);
    channel.on_presence_sync(move || {
        sink.lock().unwrap().push("sync".to_owned());
    });
    let sink = Arc::clone(&log);
    channel.on_presence_join(move |key, _current, joins| {
        let meta = joins
            .first()
            .map(|entry| entry.meta.to_string())
            .unwrap_or_default();
        sink.lock().unwrap().push(format!("join:{key}:{meta}"));
    });
    let sink = Arc::clone(&log);
    channel.on_presence_leave(move |key, _current, _leaves| {
        sink.lock().unwrap().push(format!("leave:{key}"));
    });
    log
}

async fn wait_for<F: Fn() -> bool>(what: &str, timeout: Duration, check: F) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn late_joiner_sees_snapshot_first_then_peer_diffs() {
    let addr = start_server().await;

    let (_socket_a, channel_a) = presence_channel(addr, "client-a", "alice").await;
    let log_a = record_events(&channel_a);
    channel_a.subscribe().await;
    let outcome = channel_a.track(json!({"status": "online"})).await;
    assert_eq!(outcome.status, SendStatus::Ok);

    // B joins after alice is tracked: first callback must be the snapshot
    // sync, with alice already present.
    let (_socket_b, channel_b) = presence_channel(addr, "client-b", "bob").await;
    let log_b = record_events(&channel_b);
    let state_at_sync = Arc::new(Mutex::new(None));
    {
        let channel = Arc::clone(&channel_b);
        let slot = Arc::clone(&state_at_sync);
        channel_b.on_presence_sync(move || {
            slot.lock().unwrap().get_or_insert_with(|| channel.presence_state());
        });
    }
    channel_b.subscribe().await;

    wait_for("B's snapshot sync", Duration::from_secs(5), || {
        !log_b.lock().unwrap().is_empty()
    })
    .await;
    assert_eq!(log_b.lock().unwrap()[0], "sync");

    let state = state_at_sync.lock().unwrap().clone().unwrap();
    let alice = &state["alice"];
    assert_eq!(alice.len(), 1);
    assert_eq!(alice[0].meta, json!({"status": "online"}));

    // B tracks; A observes the join with B's meta.
    channel_b.track(json!({"status": "away"})).await;
    wait_for("A to observe bob's join", Duration::from_secs(5), || {
        log_a
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.starts_with("join:bob") && e.contains("away"))
    })
    .await;
}

#[tokio::test]
async fn repeated_track_updates_in_place() {
    let addr = start_server().await;

    let (_socket, channel) = presence_channel(addr, "client-r", "alice").await;
    channel.subscribe().await;

    channel.track(json!({"status": "online"})).await;
    channel.track(json!({"status": "online"})).await;
    channel.track(json!({"status": "busy"})).await;

    wait_for("final meta to converge", Duration::from_secs(5), || {
        let state = channel.presence_state();
        state
            .get("alice")
            .is_some_and(|list| list.len() == 1 && list[0].meta == json!({"status": "busy"}))
    })
    .await;
}

#[tokio::test]
async fn untrack_is_a_no_op_without_a_prior_track() {
    let addr = start_server().await;

    let (_socket_a, channel_a) = presence_channel(addr, "client-a", "alice").await;
    let log_a = record_events(&channel_a);
    channel_a.subscribe().await;

    let (_socket_b, channel_b) = presence_channel(addr, "client-b", "bob").await;
    channel_b.subscribe().await;

    // Untrack before track, then double untrack after a real track.
    assert_eq!(channel_b.untrack().await.status, SendStatus::Ok);
    channel_b.track(json!({})).await;
    assert_eq!(channel_b.untrack().await.status, SendStatus::Ok);
    assert_eq!(channel_b.untrack().await.status, SendStatus::Ok);

    wait_for("A to observe the single leave", Duration::from_secs(5), || {
        log_a
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.as_str() == "leave:bob")
            .count()
            == 1
    })
    .await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let leaves = log_a
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.as_str() == "leave:bob")
        .count();
    assert_eq!(leaves, 1, "no-op untracks must not emit diffs");
}

#[tokio::test]
async fn disconnect_cleans_up_presence_for_peers() {
    let addr = start_server().await;

    let (_socket_a, channel_a) = presence_channel(addr, "client-a", "alice").await;
    let log_a = record_events(&channel_a);
    channel_a.subscribe().await;

    let (socket_b, channel_b) = presence_channel(addr, "client-b", "bob").await;
    channel_b.subscribe().await;
    channel_b.track(json!({"status": "here"})).await;

    wait_for("A to observe bob", Duration::from_secs(5), || {
        channel_a.presence_state().contains_key("bob")
    })
    .await;

    socket_b.disconnect().await;

    wait_for("bob's presence to vanish", Duration::from_secs(5), || {
        !channel_a.presence_state().contains_key("bob")
    })
    .await;
    assert!(log_a.lock().unwrap().iter().any(|e| e == "leave:bob"));
}
