//! End-to-end broadcast fan-out against a real in-process server.

use rb_client::{SendStatus, Socket, SocketOptions};
use rb_protocol::{BroadcastOptions, ChannelConfig};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;

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

fn broadcast_config(echo_self: bool, ack: bool) -> ChannelConfig {
    ChannelConfig {
        broadcast: BroadcastOptions { echo_self, ack },
        ..ChannelConfig::default()
    }
}

/// Collect broadcasts a channel receives into an inspectable queue.
fn collect_broadcasts(channel: &rb_client::Channel) -> mpsc::UnboundedReceiver<(String, Value)> {
    let (tx, rx) = mpsc::unbounded_channel();
    channel.on_broadcast(None, move |event, payload| {
        let _ = tx.send((event.to_owned(), payload.clone()));
    });
    rx
}

#[tokio::test]
async fn broadcast_reaches_peers_but_not_the_sender_by_default() {
    let addr = start_server().await;

    let socket_a = socket(addr, "client-a");
    socket_a.connect().await.unwrap();
    let room_a = socket_a.channel("room:1", ChannelConfig::default()).await;
    let mut received_a = collect_broadcasts(&room_a);
    room_a.subscribe().await;

    let socket_b = socket(addr, "client-b");
    socket_b.connect().await.unwrap();
    let room_b = socket_b.channel("room:1", broadcast_config(false, false)).await;
    let mut received_b = collect_broadcasts(&room_b);
    room_b.subscribe().await;

    let outcome = room_b.send("msg", json!({"text": "hi"})).await;
    assert_eq!(outcome.status, SendStatus::Ok);

    let (event, payload) = tokio::time::timeout(Duration::from_secs(5), received_a.recv())
        .await
        .expect("peer should receive the broadcast")
        .unwrap();
    assert_eq!(event, "msg");
    assert_eq!(payload, json!({"text": "hi"}));

    // The sender opted out of self-echo.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(received_b.try_recv().is_err());
}

#[tokio::test]
async fn broadcast_echoes_to_sender_when_self_is_enabled() {
    let addr = start_server().await;

    let socket_a = socket(addr, "echo-client");
    socket_a.connect().await.unwrap();
    let room = socket_a.channel("room:echo", broadcast_config(true, false)).await;
    let mut received = collect_broadcasts(&room);
    room.subscribe().await;

    room.send("ping", json!({"n": 1})).await;

    let (event, payload) = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .expect("self-echo should be delivered")
        .unwrap();
    assert_eq!(event, "ping");
    assert_eq!(payload, json!({"n": 1}));
}

#[tokio::test]
async fn acked_broadcast_resolves_ok_from_the_reply() {
    let addr = start_server().await;

    let socket_c = socket(addr, "client-c");
    socket_c.connect().await.unwrap();
    let room = socket_c.channel("room:2", broadcast_config(false, true)).await;
    assert_eq!(
        room.subscribe().await,
        rb_client::SubscribeStatus::Subscribed
    );

    let outcome = room.send("msg", json!({"text": "acked"})).await;
    assert_eq!(outcome.status, SendStatus::Ok);
    assert_eq!(outcome.code, None);
}

#[tokio::test]
async fn broadcasts_do_not_cross_topics() {
    let addr = start_server().await;

    let socket_a = socket(addr, "topic-a");
    socket_a.connect().await.unwrap();
    let room_one = socket_a.channel("room:one", ChannelConfig::default()).await;
    let mut received_one = collect_broadcasts(&room_one);
    room_one.subscribe().await;

    let socket_b = socket(addr, "topic-b");
    socket_b.connect().await.unwrap();
    let room_two = socket_b.channel("room:two", ChannelConfig::default()).await;
    room_two.subscribe().await;

    room_two.send("msg", json!({"where": "two"})).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        received_one.try_recv().is_err(),
        "room:one must not observe room:two traffic"
    );
}
