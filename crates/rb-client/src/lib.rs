//! Client for the relaybus realtime message bus.
//!
//! One [`Socket`] holds one WebSocket link to a bus instance and multiplexes
//! any number of topic [`Channel`]s over it.  The socket reconnects on
//! unclean closes with exponential backoff, heartbeats the server on the
//! system topic, and buffers outbound frames while the link is down.
//! Channels auto-rejoin after reconnect and re-track their presence meta,
//! so peers observe a leave/join pair across a transient drop.
//!
//! ```no_run
//! use rb_client::{Socket, SocketOptions};
//! use rb_protocol::ChannelConfig;
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), rb_client::ClientError> {
//! let socket = Socket::new("ws://localhost:4000/ws")?;
//! socket.connect().await?;
//!
//! let room = socket.channel("room:lobby", ChannelConfig::default()).await;
//! room.on_broadcast(Some("msg"), |_event, payload| {
//!     println!("received: {payload}");
//! });
//! room.subscribe().await;
//! room.send("msg", json!({"text": "hello"})).await;
//! # Ok(())
//! # }
//! ```

mod channel;
mod error;
mod options;
mod pending;
mod presence;
mod socket;

pub use channel::{
    Channel, ChannelState, RemoveStatus, SendOutcome, SendStatus, SubscribeStatus,
};
pub use error::ClientError;
pub use options::{
    HeartbeatHook, HeartbeatStats, HeartbeatStatus, ReconnectSchedule, SocketOptions,
    TokenProvider, default_reconnect_delay,
};
pub use presence::{PresenceCallback, PresenceSync, SyncCallback};
pub use socket::{LinkState, Socket};
