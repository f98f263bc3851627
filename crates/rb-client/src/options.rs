//! Socket configuration and the timer policies that drive it.

use crate::error::ClientError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Async retrieval hook for bearer tokens, called before each join.
pub type TokenProvider =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<String, ClientError>> + Send>> + Send + Sync>;

/// Attempt-count (1-based) to delay mapping for reconnect and rejoin timers.
pub type ReconnectSchedule = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Hook observing the heartbeat engine.  The variants are part of the public
/// contract; dashboards key on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    Sent,
    Ok,
    Error,
    Timeout,
    Disconnected,
}

pub type HeartbeatHook = Arc<dyn Fn(HeartbeatStatus) + Send + Sync>;

/// Round-trip aggregations over successful heartbeat probes.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeartbeatStats {
    pub last: Option<Duration>,
    pub min: Option<Duration>,
    pub max: Option<Duration>,
    pub count: u64,
    pub(crate) total: Duration,
}

impl HeartbeatStats {
    pub fn avg(&self) -> Option<Duration> {
        if self.count == 0 {
            return None;
        }
        Some(self.total / u32::try_from(self.count).unwrap_or(u32::MAX))
    }

    pub(crate) fn record(&mut self, rtt: Duration) {
        self.last = Some(rtt);
        self.min = Some(self.min.map_or(rtt, |m| m.min(rtt)));
        self.max = Some(self.max.map_or(rtt, |m| m.max(rtt)));
        self.total += rtt;
        self.count += 1;
    }
}

/// Default reconnect schedule: 1s, 2s, 5s, then 10s for every later attempt.
pub fn default_reconnect_delay(attempt: u32) -> Duration {
    match attempt {
        0 | 1 => Duration::from_secs(1),
        2 => Duration::from_secs(2),
        3 => Duration::from_secs(5),
        _ => Duration::from_secs(10),
    }
}

#[derive(Clone)]
pub struct SocketOptions {
    /// Identity reported to the server; lands in channel member listings.
    pub client_id: Option<String>,
    pub heartbeat_interval: Duration,
    /// Deadline for each request awaiting a reply.
    pub request_timeout: Duration,
    pub reconnect_schedule: ReconnectSchedule,
    pub heartbeat_hook: Option<HeartbeatHook>,
    /// Literal token used until `set_auth`/a provider replaces it.
    pub access_token: Option<String>,
    pub token_provider: Option<TokenProvider>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        SocketOptions {
            client_id: None,
            heartbeat_interval: Duration::from_secs(25),
            request_timeout: Duration::from_secs(10),
            reconnect_schedule: Arc::new(default_reconnect_delay),
            heartbeat_hook: None,
            access_token: None,
            token_provider: None,
        }
    }
}

impl std::fmt::Debug for SocketOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketOptions")
            .field("client_id", &self.client_id)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("request_timeout", &self.request_timeout)
            .field("has_heartbeat_hook", &self.heartbeat_hook.is_some())
            .field("has_access_token", &self.access_token.is_some())
            .field("has_token_provider", &self.token_provider.is_some())
            .finish()
    }
}
