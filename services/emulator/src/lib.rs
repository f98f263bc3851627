//! Synthetic bus traffic for soak tests and manual load runs.
//!
//! Spawns a fleet of clients against one bus endpoint.  Each client joins a
//! room (round-robin over the room count), optionally tracks presence, and
//! broadcasts a numbered message on an interval.  Client starts are
//! staggered across one interval so the send pattern spreads out instead of
//! thundering in lockstep.

use rb_client::{SendStatus, Socket, SocketOptions, SubscribeStatus};
use rb_protocol::{BroadcastOptions, ChannelConfig, PresenceOptions};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// Bus endpoint, e.g. `ws://localhost:4000/ws`.
    pub server_url: String,
    pub clients: usize,
    pub rooms: usize,
    pub message_interval: Duration,
    /// Track a presence meta per client and re-track across reconnects.
    pub presence: bool,
    /// Total run length; `None` runs until interrupted.
    pub run_for: Option<Duration>,
}

/// Counters shared across the fleet, sampled by the progress logger.
#[derive(Default)]
pub struct EmulatorStats {
    pub sent: AtomicU64,
    pub received: AtomicU64,
    pub send_failures: AtomicU64,
}

pub fn room_topic(client_index: usize, rooms: usize) -> String {
    format!("load:room:{}", client_index % rooms.max(1))
}

pub fn client_id(client_index: usize) -> String {
    format!("emulator-{client_index}")
}

async fn run_client(
    config: EmulatorConfig,
    client_index: usize,
    stats: Arc<EmulatorStats>,
) -> Result<(), rb_client::ClientError> {
    let socket = Socket::with_options(
        &config.server_url,
        SocketOptions {
            client_id: Some(client_id(client_index)),
            ..SocketOptions::default()
        },
    )?;
    socket.connect().await?;

    let topic = room_topic(client_index, config.rooms);
    let channel_config = ChannelConfig {
        broadcast: BroadcastOptions {
            echo_self: false,
            ack: true,
        },
        presence: if config.presence {
            PresenceOptions {
                key: Some(client_id(client_index)),
                enabled: true,
            }
        } else {
            PresenceOptions::default()
        },
    };
    let channel = socket.channel(&topic, channel_config).await;

    let received = Arc::clone(&stats);
    channel.on_broadcast(Some("load"), move |_event, _payload| {
        received.received.fetch_add(1, Ordering::Relaxed);
    });

    match channel.subscribe().await {
        SubscribeStatus::Subscribed => {}
        other => {
            warn!(client = client_index, topic = %topic, ?other, "subscribe failed");
            return Ok(());
        }
    }
    if config.presence {
        channel
            .track(json!({"client": client_id(client_index), "state": "load"}))
            .await;
    }

    // Stagger starts across one interval.
    let offset = config.message_interval.as_millis() as u64 * client_index as u64
        / config.clients.max(1) as u64;
    tokio::time::sleep(Duration::from_millis(offset)).await;

    let mut ticker = tokio::time::interval(config.message_interval);
    let mut sequence: u64 = 0;
    loop {
        ticker.tick().await;
        sequence += 1;
        let outcome = channel
            .send(
                "load",
                json!({"client": client_id(client_index), "n": sequence}),
            )
            .await;
        match outcome.status {
            SendStatus::Ok => {
                stats.sent.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                stats.send_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Run the fleet until the configured duration elapses (or forever).
pub async fn run(config: EmulatorConfig) {
    let stats = Arc::new(EmulatorStats::default());
    info!(
        clients = config.clients,
        rooms = config.rooms,
        interval_ms = config.message_interval.as_millis() as u64,
        presence = config.presence,
        "emulator fleet starting"
    );

    let mut tasks = Vec::with_capacity(config.clients);
    for client_index in 0..config.clients {
        let client_config = config.clone();
        let client_stats = Arc::clone(&stats);
        tasks.push(tokio::spawn(async move {
            if let Err(e) = run_client(client_config, client_index, client_stats).await {
                warn!(client = client_index, error = %e, "client ended");
            }
        }));
    }

    let reporter_stats = Arc::clone(&stats);
    let reporter = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            info!(
                sent = reporter_stats.sent.load(Ordering::Relaxed),
                received = reporter_stats.received.load(Ordering::Relaxed),
                send_failures = reporter_stats.send_failures.load(Ordering::Relaxed),
                "emulator progress"
            );
        }
    });

    match config.run_for {
        Some(duration) => tokio::time::sleep(duration).await,
        None => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }

    for task in &tasks {
        task.abort();
    }
    reporter.abort();
    info!(
        sent = stats.sent.load(Ordering::Relaxed),
        received = stats.received.load(Ordering::Relaxed),
        send_failures = stats.send_failures.load(Ordering::Relaxed),
        "emulator finished"
    );
}
