//! Observable protocol limits: per-connection subscription cap, broadcast
//! rate limiting with a reply-carried retry hint, and presence meta size.

use rb_client::{SendStatus, Socket, SocketOptions};
use rb_protocol::{BroadcastOptions, ChannelConfig, PresenceOptions, error_codes, limits};
use serde_json::json;
use std::net::SocketAddr;

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

fn socket(addr: SocketAddr, client_id: &str) -> Socket {
    Socket::with_options(
        &format!("ws://{addr}/ws"),
        SocketOptions {
            client_id: Some(client_id.to_owned()),
            ..SocketOptions::default()
        },
    )
    .unwrap()
}

#[tokio::test]
async fn subscription_cap_rejects_the_next_join() {
    let addr = start_server().await;
    let socket = socket(addr, "greedy");
    socket.connect().await.unwrap();

    for i in 0..limits::MAX_SUBSCRIPTIONS_PER_CONN {
        let channel = socket
            .channel(&format!("room:{i}"), ChannelConfig::default())
            .await;
        assert_eq!(
            channel.subscribe().await,
            rb_client::SubscribeStatus::Subscribed,
            "join {i} should be admitted"
        );
    }

    let over = socket.channel("room:over", ChannelConfig::default()).await;
    match over.subscribe().await {
        rb_client::SubscribeStatus::ChannelError(detail) => {
            assert_eq!(detail.code.as_deref(), Some(error_codes::CHANNEL_FULL));
        }
        other => panic!("expected ChannelError, got {other:?}"),
    }
}

#[tokio::test]
async fn broadcast_rate_limit_reports_retry_after() {
    let addr = start_server().await;

    // Blast requests without waiting on individual acks so the whole burst
    // lands inside one rate window.
    let mut link = rb_test_utils::TestLink::connect(&format!("ws://{addr}/ws?client_id=chatty"))
        .await
        .unwrap();
    let ack = ChannelConfig {
        broadcast: BroadcastOptions {
            echo_self: false,
            ack: true,
        },
        ..ChannelConfig::default()
    };
    link.join("room:rate", &ack).await.unwrap();

    for _ in 0..150 {
        let frame = rb_protocol::Frame::new(
            None,
            Some(link.next_seq()),
            "room:rate",
            rb_protocol::EventKind::Broadcast,
            json!({"type": "broadcast", "event": "burst", "payload": {}}),
        );
        link.send_frame(&frame).await.unwrap();
    }

    let mut limited = None;
    for _ in 0..150 {
        let reply = link
            .recv_frame_timeout(std::time::Duration::from_secs(5))
            .await
            .unwrap();
        let payload: rb_protocol::ReplyPayload = serde_json::from_value(reply.payload).unwrap();
        if let Some(detail) = payload.error_response() {
            limited = Some(detail);
            break;
        }
    }
    let detail = limited.expect("server should have rate limited the burst");
    assert_eq!(detail.code.as_deref(), Some(error_codes::MESSAGE_RATE_LIMITED));
    let retry_after = detail.retry_after.expect("retry_after must be present");
    assert!(retry_after >= 1 && retry_after <= 1000);
}

#[tokio::test]
async fn oversized_presence_meta_is_refused() {
    let addr = start_server().await;
    let socket = socket(addr, "verbose");
    socket.connect().await.unwrap();
    let channel = socket
        .channel(
            "room:meta",
            ChannelConfig {
                presence: PresenceOptions {
                    key: Some("verbose".to_owned()),
                    enabled: true,
                },
                ..ChannelConfig::default()
            },
        )
        .await;
    channel.subscribe().await;

    let blob = "x".repeat(limits::MAX_PRESENCE_BYTES);
    let outcome = channel.track(json!({"blob": blob})).await;
    assert_eq!(outcome.status, SendStatus::Error);
    assert_eq!(outcome.code.as_deref(), Some(error_codes::PRESENCE_TOO_LARGE));

    // A sane meta still lands afterwards.
    let outcome = channel.track(json!({"status": "ok"})).await;
    assert_eq!(outcome.status, SendStatus::Ok);
}

#[tokio::test]
async fn presence_without_a_key_is_a_key_conflict() {
    let addr = start_server().await;
    let socket = socket(addr, "keyless");
    socket.connect().await.unwrap();
    let channel = socket
        .channel(
            "room:keyless",
            ChannelConfig {
                presence: PresenceOptions {
                    key: None,
                    enabled: true,
                },
                ..ChannelConfig::default()
            },
        )
        .await;
    channel.subscribe().await;

    let outcome = channel.track(json!({})).await;
    assert_eq!(outcome.status, SendStatus::Error);
    assert_eq!(
        outcome.code.as_deref(),
        Some(error_codes::PRESENCE_KEY_CONFLICT)
    );
}
