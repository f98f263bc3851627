//! Cross-instance relay: two bus instances share an in-memory fabric hub,
//! and members on different instances see each other's broadcasts and
//! presence exactly once.

use rb_client::{Channel, Socket, SocketOptions};
use rb_fabric::MemoryFabric;
use rb_protocol::{ChannelConfig, PresenceOptions};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

async fn start_instance(fabric: MemoryFabric) -> SocketAddr {
    let state = server::AppState::with_fabric(None, Arc::new(fabric));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, server::build_router(state))
            .await
            .unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr, client_id: &str, config: ChannelConfig) -> (Socket, Arc<Channel>) {
    let socket = Socket::with_options(
        &format!("ws://{addr}/ws"),
        SocketOptions {
            client_id: Some(client_id.to_owned()),
            ..SocketOptions::default()
        },
    )
    .unwrap();
    socket.connect().await.unwrap();
    let channel = socket.channel("room:5", config).await;
    (socket, channel)
}

fn collect_broadcasts(channel: &Channel) -> mpsc::UnboundedReceiver<(String, Value)> {
    let (tx, rx) = mpsc::unbounded_channel();
    channel.on_broadcast(None, move |event, payload| {
        let _ = tx.send((event.to_owned(), payload.clone()));
    });
    rx
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
async fn broadcast_crosses_instances_exactly_once() {
    let hub = MemoryFabric::new();
    let addr_one = start_instance(hub.peer()).await;
    let addr_two = start_instance(hub.peer()).await;

    let (_socket_a, channel_a) = connect(addr_one, "client-a", ChannelConfig::default()).await;
    channel_a.subscribe().await;

    let (_socket_b, channel_b) = connect(addr_two, "client-b", ChannelConfig::default()).await;
    let mut received_b = collect_broadcasts(&channel_b);
    channel_b.subscribe().await;

    // Let the second instance's fabric subscription settle before sending.
    tokio::time::sleep(Duration::from_millis(100)).await;

    channel_a.send("msg", json!({"from": "a"})).await;

    let (event, payload) = tokio::time::timeout(Duration::from_secs(5), received_b.recv())
        .await
        .expect("B should receive the relayed broadcast")
        .unwrap();
    assert_eq!(event, "msg");
    assert_eq!(payload, json!({"from": "a"}));

    // Exactly one copy: the origin instance must drop its own fabric echo.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        received_b.try_recv().is_err(),
        "duplicate cross-instance delivery"
    );
}

#[tokio::test]
async fn sender_instance_does_not_echo_back_through_the_fabric() {
    let hub = MemoryFabric::new();
    let addr_one = start_instance(hub.peer()).await;
    let addr_two = start_instance(hub.peer()).await;

    let (_socket_a, channel_a) = connect(addr_one, "client-a", ChannelConfig::default()).await;
    let mut received_a = collect_broadcasts(&channel_a);
    channel_a.subscribe().await;

    let (_socket_b, channel_b) = connect(addr_two, "client-b", ChannelConfig::default()).await;
    channel_b.subscribe().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    channel_a.send("msg", json!({"n": 1})).await;

    // A opted out of self-echo; the fabric echo of its own instance must not
    // resurrect the broadcast either.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(received_a.try_recv().is_err());
}

#[tokio::test]
async fn presence_converges_across_instances() {
    let hub = MemoryFabric::new();
    let addr_one = start_instance(hub.peer()).await;
    let addr_two = start_instance(hub.peer()).await;

    let presence_config = |key: &str| ChannelConfig {
        presence: PresenceOptions {
            key: Some(key.to_owned()),
            enabled: true,
        },
        ..ChannelConfig::default()
    };

    let (_socket_a, channel_a) = connect(addr_one, "client-a", presence_config("alice")).await;
    channel_a.subscribe().await;

    let (socket_b, channel_b) = connect(addr_two, "client-b", presence_config("bob")).await;
    channel_b.subscribe().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    channel_a.track(json!({"instance": "one"})).await;
    channel_b.track(json!({"instance": "two"})).await;

    // Both sides converge on the union.
    wait_for("A to see bob", Duration::from_secs(5), || {
        channel_a.presence_state().contains_key("bob")
    })
    .await;
    wait_for("B to see alice", Duration::from_secs(5), || {
        channel_b.presence_state().contains_key("alice")
    })
    .await;

    // B's disconnect propagates a leave to A's instance.
    socket_b.disconnect().await;
    wait_for("bob to leave everywhere", Duration::from_secs(5), || {
        !channel_a.presence_state().contains_key("bob")
    })
    .await;
}

#[tokio::test]
async fn late_cross_instance_joiner_inherits_remote_presence() {
    let hub = MemoryFabric::new();
    let addr_one = start_instance(hub.peer()).await;
    let addr_two = start_instance(hub.peer()).await;

    let presence_config = |key: &str| ChannelConfig {
        presence: PresenceOptions {
            key: Some(key.to_owned()),
            enabled: true,
        },
        ..ChannelConfig::default()
    };

    // Alice tracks on instance one; a shadow must exist on instance two
    // before carol joins there — but only once instance two subscribes,
    // which needs a local member. Dave holds the subscription open.
    let (_socket_d, channel_d) = connect(addr_two, "client-d", ChannelConfig::default()).await;
    channel_d.subscribe().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (_socket_a, channel_a) = connect(addr_one, "client-a", presence_config("alice")).await;
    channel_a.subscribe().await;
    channel_a.track(json!({"status": "online"})).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let (_socket_c, channel_c) = connect(addr_two, "client-c", presence_config("carol")).await;
    channel_c.subscribe().await;

    wait_for("carol's snapshot to include alice", Duration::from_secs(5), || {
        channel_c
            .presence_state()
            .get("alice")
            .is_some_and(|list| list.iter().any(|p| p.meta == json!({"status": "online"})))
    })
    .await;
}
