//! HTTP surface contract: REST broadcast injection, channel inspection,
//! and health.

use rb_client::{Channel, Socket, SocketOptions};
use rb_protocol::ChannelConfig;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

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

async fn subscribed_client(addr: SocketAddr, client_id: &str, topic: &str) -> (Socket, Arc<Channel>) {
    let socket = Socket::with_options(
        &format!("ws://{addr}/ws"),
        SocketOptions {
            client_id: Some(client_id.to_owned()),
            ..SocketOptions::default()
        },
    )
    .unwrap();
    socket.connect().await.unwrap();
    let channel = socket.channel(topic, ChannelConfig::default()).await;
    channel.subscribe().await;
    (socket, channel)
}

fn collect_broadcasts(channel: &Channel) -> mpsc::UnboundedReceiver<(String, Value)> {
    let (tx, rx) = mpsc::unbounded_channel();
    channel.on_broadcast(None, move |event, payload| {
        let _ = tx.send((event.to_owned(), payload.clone()));
    });
    rx
}

#[tokio::test]
async fn rest_broadcast_reaches_all_members_and_reports_the_count() {
    let addr = start_server(None).await;
    let (_sa, channel_a) = subscribed_client(addr, "client-a", "room:rest").await;
    let (_sb, channel_b) = subscribed_client(addr, "client-b", "room:rest").await;
    let mut received_a = collect_broadcasts(&channel_a);
    let mut received_b = collect_broadcasts(&channel_b);

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/api/broadcast"))
        .json(&json!({"topic": "room:rest", "event": "announce", "payload": {"v": 1}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], json!("ok"));
    assert_eq!(body["recipientCount"], json!(2));

    for received in [&mut received_a, &mut received_b] {
        let (event, payload) = tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .expect("member should receive the api broadcast")
            .unwrap();
        assert_eq!(event, "announce");
        assert_eq!(payload, json!({"v": 1}));
    }
}

#[tokio::test]
async fn rest_broadcast_validates_the_body() {
    let addr = start_server(None).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/api/broadcast"))
        .json(&json!({"event": "announce"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], json!("error"));
    assert!(body["reason"].as_str().is_some());
}

#[tokio::test]
async fn rest_broadcast_requires_a_token_when_auth_is_enabled() {
    let secret = "http-secret";
    let addr = start_server(Some(server::auth::AuthVerifier::new(secret, None, None))).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/api/broadcast"))
        .json(&json!({"topic": "room:x", "event": "e", "payload": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let exp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
        + 600;
    let token = jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &json!({"sub": "ops", "exp": exp}),
        &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap();

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/api/broadcast"))
        .bearer_auth(token)
        .json(&json!({"topic": "room:x", "event": "e", "payload": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn channel_listing_reports_member_client_ids() {
    let addr = start_server(None).await;
    let (_sa, _ca) = subscribed_client(addr, "client-a", "room:list").await;
    let (_sb, _cb) = subscribed_client(addr, "client-b", "room:list").await;

    let body: Value = reqwest::get(format!("http://{addr}/api/channels/room:list"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["topic"], json!("room:list"));
    assert_eq!(body["memberCount"], json!(2));
    let mut ids: Vec<String> = body["members"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["clientId"].as_str().unwrap().to_owned())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["client-a".to_owned(), "client-b".to_owned()]);

    let empty: Value = reqwest::get(format!("http://{addr}/api/channels/room:empty"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(empty["memberCount"], json!(0));
}

#[tokio::test]
async fn health_reports_totals() {
    let addr = start_server(None).await;

    let body: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], json!("healthy"));
    assert_eq!(body["totalChannels"], json!(0));
    assert_eq!(body["totalMembers"], json!(0));

    let (_sa, _ca) = subscribed_client(addr, "client-a", "room:h1").await;
    let (_sb, _cb) = subscribed_client(addr, "client-b", "room:h1").await;
    let (_sc, _cc) = subscribed_client(addr, "client-c", "room:h2").await;

    let body: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["totalChannels"], json!(2));
    assert_eq!(body["totalMembers"], json!(3));
}
