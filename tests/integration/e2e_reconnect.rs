//! Reconnect behavior against a real server: peers observe a leave/join
//! pair across a member's reconnect, and auth failures gate rejoin until
//! credentials are refreshed.

use rb_client::{ChannelState, Socket, SocketOptions, SubscribeStatus};
use rb_protocol::{ChannelConfig, PresenceOptions, error_codes};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn presence_config(key: &str) -> ChannelConfig {
    ChannelConfig {
        presence: PresenceOptions {
            key: Some(key.to_owned()),
            enabled: true,
        },
        ..ChannelConfig::default()
    }
}

async fn start_server(auth: Option<server::auth::AuthVerifier>) -> SocketAddr {
    let state = server::AppState::new(auth);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, server::build_router(state))
            .await
            .unwrap();
    });
    addr
}

fn fast_socket(addr: SocketAddr, client_id: &str) -> Socket {
    Socket::with_options(
        &format!("ws://{addr}/ws"),
        SocketOptions {
            client_id: Some(client_id.to_owned()),
            reconnect_schedule: Arc::new(|_| Duration::from_millis(50)),
            ..SocketOptions::default()
        },
    )
    .unwrap()
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

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn token(secret: &str, exp: u64) -> String {
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &json!({"sub": "client-a", "exp": exp}),
        &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

#[tokio::test]
async fn peers_observe_leave_then_join_across_a_reconnect() {
    let addr = start_server(None).await;

    // Observer B.
    let socket_b = fast_socket(addr, "client-b");
    socket_b.connect().await.unwrap();
    let channel_b = socket_b.channel("room:4", presence_config("bob")).await;
    let events = Arc::new(Mutex::new(Vec::new()));
    {
        let sink = Arc::clone(&events);
        channel_b.on_presence_leave(move |key, _, _| {
            sink.lock().unwrap().push(format!("leave:{key}"));
        });
        let sink = Arc::clone(&events);
        channel_b.on_presence_join(move |key, _, _| {
            sink.lock().unwrap().push(format!("join:{key}"));
        });
    }
    channel_b.subscribe().await;

    // A joins, tracks, then drops and reconnects.
    let socket_a = fast_socket(addr, "client-a");
    socket_a.connect().await.unwrap();
    let channel_a = socket_a.channel("room:4", presence_config("alice")).await;
    channel_a.subscribe().await;
    channel_a.track(json!({"u": 1})).await;

    wait_for("B to observe alice", Duration::from_secs(5), || {
        events.lock().unwrap().iter().any(|e| e == "join:alice")
    })
    .await;

    socket_a.disconnect().await;
    wait_for("B to observe alice leave", Duration::from_secs(5), || {
        events.lock().unwrap().iter().any(|e| e == "leave:alice")
    })
    .await;

    // Reconnect: the channel rejoins and re-tracks the saved meta.
    socket_a.connect().await.unwrap();
    wait_for("A's channel to rejoin", Duration::from_secs(5), || {
        channel_a.state() == ChannelState::Joined
    })
    .await;
    wait_for("B to observe alice rejoin", Duration::from_secs(5), || {
        let log = events.lock().unwrap();
        let leave_at = log.iter().position(|e| e == "leave:alice");
        let rejoin_at = log.iter().rposition(|e| e == "join:alice");
        matches!((leave_at, rejoin_at), (Some(l), Some(j)) if j > l)
    })
    .await;

    // The re-track restored the meta for peers.
    wait_for("alice presence restored", Duration::from_secs(5), || {
        channel_b
            .presence_state()
            .get("alice")
            .is_some_and(|list| list.iter().any(|p| p.meta == json!({"u": 1})))
    })
    .await;
}

#[tokio::test]
async fn expired_token_blocks_join_until_auth_is_refreshed() {
    let secret = "reconnect-secret";
    let addr = start_server(Some(server::auth::AuthVerifier::new(secret, None, None))).await;

    let socket = Socket::with_options(
        &format!("ws://{addr}/ws"),
        SocketOptions {
            client_id: Some("client-a".to_owned()),
            access_token: Some(token(secret, now_secs() - 3600)),
            reconnect_schedule: Arc::new(|_| Duration::from_millis(50)),
            ..SocketOptions::default()
        },
    )
    .unwrap();
    socket.connect().await.unwrap();

    let channel = socket.channel("room:auth", ChannelConfig::default()).await;
    match channel.subscribe().await {
        SubscribeStatus::ChannelError(detail) => {
            assert_eq!(detail.code.as_deref(), Some(error_codes::AUTH_EXPIRED));
            assert_eq!(detail.reason, "Token has expired");
        }
        other => panic!("expected ChannelError, got {other:?}"),
    }
    assert_eq!(channel.state(), ChannelState::Errored);

    // Refresh the token and subscribe again: this time it lands.
    socket.set_auth(&token(secret, now_secs() + 600)).await;
    assert_eq!(channel.subscribe().await, SubscribeStatus::Subscribed);
    assert_eq!(channel.state(), ChannelState::Joined);
}
