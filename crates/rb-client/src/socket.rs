//! The socket: one duplex link multiplexing every channel of a client.
//!
//! A supervisor task owns the connection lifecycle: connect, run the link
//! (read loop + heartbeat timer), and on unclean close sleep out the
//! reconnect schedule before trying again.  `disconnect` cancels the
//! supervisor cleanly.  All writes go through a per-connection writer task;
//! frames sent while the link is down queue in a bounded FIFO buffer that
//! drains on the next open.

use crate::channel::{Channel, RemoveStatus};
use crate::error::ClientError;
use crate::options::{HeartbeatStats, HeartbeatStatus, SocketOptions};
use crate::pending::{PendingReplies, ReplyOutcome};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use rb_protocol::{ChannelConfig, EventKind, Frame, ReplyPayload, ReplyStatus, SYSTEM_TOPIC, limits};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use url::Url;

const WRITER_CAP: usize = 128;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Link readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Default)]
struct HeartbeatState {
    /// The one probe allowed in flight: (sequence, send instant).
    outstanding: Option<(String, Instant)>,
    stats: HeartbeatStats,
}

pub(crate) struct SocketInner {
    url: String,
    pub(crate) options: SocketOptions,
    seq: AtomicU64,
    state_tx: watch::Sender<LinkState>,
    writer: RwLock<Option<mpsc::Sender<Message>>>,
    send_buffer: Mutex<VecDeque<String>>,
    pub(crate) pending: PendingReplies,
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    heartbeat: Mutex<HeartbeatState>,
    access_token: RwLock<Option<String>>,
    manually_closed: AtomicBool,
    reconnect_attempts: AtomicU32,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    error_hooks: std::sync::Mutex<Vec<Arc<dyn Fn(&ClientError) + Send + Sync>>>,
}

impl SocketInner {
    pub(crate) fn next_seq(&self) -> String {
        self.seq.fetch_add(1, Ordering::SeqCst).to_string()
    }

    pub(crate) fn link_state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: LinkState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "link state");
        }
    }

    /// Resolve the token to attach to a join: the async provider wins over
    /// the stored literal.
    pub(crate) async fn current_token(&self) -> Option<String> {
        if let Some(provider) = &self.options.token_provider {
            match provider().await {
                Ok(token) => return Some(token),
                Err(e) => {
                    warn!(error = %e, "token provider failed");
                    return None;
                }
            }
        }
        self.access_token.read().await.clone()
    }

    /// Hand a frame to the writer, or queue it while the link is down.
    pub(crate) async fn transmit(&self, text: String) {
        if self.link_state() == LinkState::Open {
            let writer = self.writer.read().await.clone();
            if let Some(writer) = writer {
                if writer.send(Message::Text(text.clone().into())).await.is_ok() {
                    return;
                }
            }
        }
        self.buffer_frame(text).await;
    }

    async fn buffer_frame(&self, text: String) {
        let mut buffer = self.send_buffer.lock().await;
        if buffer.len() >= limits::SEND_BUFFER_CAP {
            buffer.pop_front();
            debug!("send buffer full, dropped oldest frame");
        }
        buffer.push_back(text);
    }

    /// Drain the send buffer FIFO until empty or the link flips away from
    /// open again.
    async fn flush_buffer(&self) {
        loop {
            if self.link_state() != LinkState::Open {
                return;
            }
            let Some(text) = self.send_buffer.lock().await.pop_front() else {
                return;
            };
            let writer = self.writer.read().await.clone();
            let Some(writer) = writer else {
                // Link went away mid-flush; requeue at the front.
                self.send_buffer.lock().await.push_front(text);
                return;
            };
            if writer.send(Message::Text(text.clone().into())).await.is_err() {
                self.send_buffer.lock().await.push_front(text);
                return;
            }
        }
    }

    async fn send_raw(&self, msg: Message) -> bool {
        let writer = self.writer.read().await.clone();
        match writer {
            Some(writer) => writer.send(msg).await.is_ok(),
            None => false,
        }
    }

    /// Send a request frame and await its terminal outcome.  The sequence is
    /// registered before the frame leaves, so a fast reply cannot race the
    /// registration; requests composed while the link is down age in the
    /// send buffer against the same deadline.
    pub(crate) async fn request(&self, frame: Frame, timeout: Duration) -> ReplyOutcome {
        let Some(seq) = frame.seq.clone() else {
            return ReplyOutcome::Error(json!({"reason": "request frame without sequence"}));
        };
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                return ReplyOutcome::Error(json!({"reason": format!("encode failed: {e}")}));
            }
        };
        let rx = self.pending.register(&seq, timeout);
        self.transmit(text).await;
        rx.await.unwrap_or(ReplyOutcome::Disconnected)
    }

    async fn route_text(self: &Arc<Self>, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "dropping undecodable frame");
                return;
            }
        };

        if frame.event_kind() == Some(EventKind::Reply) {
            let Some(seq) = frame.seq.clone() else {
                debug!("reply without sequence dropped");
                return;
            };
            if frame.topic == SYSTEM_TOPIC && self.complete_heartbeat(&seq, &frame).await {
                return;
            }
            let outcome = match serde_json::from_value::<ReplyPayload>(frame.payload.clone()) {
                Ok(reply) => match reply.status {
                    ReplyStatus::Ok => ReplyOutcome::Ok(reply.response),
                    ReplyStatus::Error => ReplyOutcome::Error(reply.response),
                },
                Err(_) => ReplyOutcome::Error(frame.payload),
            };
            if !self.pending.resolve(&seq, outcome) {
                debug!(seq = %seq, "late reply discarded");
            }
            return;
        }

        let channel = self.channels.read().await.get(&frame.topic).cloned();
        match channel {
            Some(channel) => channel.handle_frame(frame),
            None => debug!(topic = %frame.topic, event = %frame.event, "frame for unknown channel dropped"),
        }
    }

    /// Settle the outstanding heartbeat probe if this reply matches it.
    async fn complete_heartbeat(&self, seq: &str, frame: &Frame) -> bool {
        let mut hb = self.heartbeat.lock().await;
        let started = match hb.outstanding.take() {
            Some((outstanding, started)) if outstanding == seq => started,
            other => {
                hb.outstanding = other;
                return false;
            }
        };
        let ok = serde_json::from_value::<ReplyPayload>(frame.payload.clone())
            .map(|reply| reply.status == ReplyStatus::Ok)
            .unwrap_or(false);
        if ok {
            hb.stats.record(started.elapsed());
        }
        drop(hb);
        if let Some(hook) = &self.options.heartbeat_hook {
            hook(if ok {
                HeartbeatStatus::Ok
            } else {
                HeartbeatStatus::Error
            });
        }
        true
    }

    fn report_error(&self, error: &ClientError) {
        let hooks: Vec<_> = self
            .error_hooks
            .lock()
            .expect("error hooks lock")
            .clone();
        for hook in hooks {
            hook(error);
        }
    }

    /// One heartbeat interval tick.  Returns false on liveness failure,
    /// which tears the link down.
    async fn heartbeat_tick(&self) -> bool {
        {
            let hb = self.heartbeat.lock().await;
            if hb.outstanding.is_some() {
                drop(hb);
                warn!("heartbeat timeout, closing link");
                if let Some(hook) = &self.options.heartbeat_hook {
                    hook(HeartbeatStatus::Timeout);
                }
                self.send_raw(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "heartbeat timeout".into(),
                })))
                .await;
                return false;
            }
        }

        let seq = self.next_seq();
        let frame = Frame::new(
            None,
            Some(seq.clone()),
            SYSTEM_TOPIC,
            EventKind::Heartbeat,
            json!({}),
        );
        let Ok(text) = frame.encode() else {
            return true;
        };
        self.heartbeat.lock().await.outstanding = Some((seq, Instant::now()));
        if !self.send_raw(Message::Text(text.into())).await {
            self.heartbeat.lock().await.outstanding = None;
            return false;
        }
        if let Some(hook) = &self.options.heartbeat_hook {
            hook(HeartbeatStatus::Sent);
        }
        true
    }
}

/// Handle to one bus connection.  Cheap to clone; all clones share the link.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl Socket {
    pub fn new(url: &str) -> Result<Self, ClientError> {
        Self::with_options(url, SocketOptions::default())
    }

    pub fn with_options(url: &str, options: SocketOptions) -> Result<Self, ClientError> {
        let url = build_url(url, options.client_id.as_deref())?;
        let (state_tx, _) = watch::channel(LinkState::Closed);
        let access_token = options.access_token.clone();
        Ok(Socket {
            inner: Arc::new(SocketInner {
                url,
                options,
                seq: AtomicU64::new(1),
                state_tx,
                writer: RwLock::new(None),
                send_buffer: Mutex::new(VecDeque::new()),
                pending: PendingReplies::new(),
                channels: RwLock::new(HashMap::new()),
                heartbeat: Mutex::new(HeartbeatState::default()),
                access_token: RwLock::new(access_token),
                manually_closed: AtomicBool::new(false),
                reconnect_attempts: AtomicU32::new(0),
                supervisor: Mutex::new(None),
                error_hooks: std::sync::Mutex::new(Vec::new()),
            }),
        })
    }

    /// Start the connection supervisor (if not already running) and wait for
    /// the link to open.  Reconnection after unclean closes is automatic
    /// from here on.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.inner.manually_closed.store(false, Ordering::SeqCst);
        {
            let mut supervisor = self.inner.supervisor.lock().await;
            let running = supervisor.as_ref().is_some_and(|task| !task.is_finished());
            if !running {
                let inner = Arc::clone(&self.inner);
                *supervisor = Some(tokio::spawn(run_supervisor(inner)));
            }
        }

        let mut state_rx = self.inner.state_tx.subscribe();
        loop {
            if *state_rx.borrow_and_update() == LinkState::Open {
                return Ok(());
            }
            if state_rx.changed().await.is_err() {
                return Err(ClientError::Closed);
            }
        }
    }

    /// Clean shutdown: no reconnect is armed and channels stay quiet until
    /// the next `connect`.
    pub async fn disconnect(&self) {
        self.inner.manually_closed.store(true, Ordering::SeqCst);
        if self.inner.link_state() == LinkState::Open {
            self.inner.set_state(LinkState::Closing);
            self.inner
                .send_raw(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client disconnect".into(),
                })))
                .await;
        }
        let supervisor = self.inner.supervisor.lock().await.take();
        if let Some(task) = supervisor {
            // The read loop sees the close and the supervisor exits on the
            // manual-close flag; give it a moment, then stop waiting.
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
        self.inner.set_state(LinkState::Closed);
    }

    /// The channel for a topic, creating it on first use.  A client holds at
    /// most one channel per topic; later calls return the existing one and
    /// ignore the new config.
    pub async fn channel(&self, topic: &str, config: ChannelConfig) -> Arc<Channel> {
        let mut channels = self.inner.channels.write().await;
        if let Some(existing) = channels.get(topic) {
            return Arc::clone(existing);
        }
        let channel = Channel::new(topic.to_owned(), config, Arc::downgrade(&self.inner));
        channels.insert(topic.to_owned(), Arc::clone(&channel));
        channel
    }

    /// Unsubscribe a channel and drop it from the socket.
    pub async fn remove_channel(&self, topic: &str) -> RemoveStatus {
        let channel = self.inner.channels.write().await.remove(topic);
        match channel {
            Some(channel) => channel.unsubscribe().await,
            None => RemoveStatus::Ok,
        }
    }

    pub fn state(&self) -> LinkState {
        self.inner.link_state()
    }

    pub fn on_state_change(&self) -> watch::Receiver<LinkState> {
        self.inner.state_tx.subscribe()
    }

    /// Store a literal bearer token for subsequent joins.  While the link is
    /// open the token is also pushed to the server, so later joins on this
    /// connection may omit it.
    pub async fn set_auth(&self, token: &str) {
        *self.inner.access_token.write().await = Some(token.to_owned());
        if self.inner.link_state() == LinkState::Open {
            let frame = Frame::new(
                None,
                None,
                SYSTEM_TOPIC,
                EventKind::AccessToken,
                json!({"access_token": token}),
            );
            if let Ok(text) = frame.encode() {
                self.inner.transmit(text).await;
            }
        }
    }

    /// Register a hook observing transport-level failures (failed connects,
    /// read errors).  Protocol errors never reach this; they surface on the
    /// request that caused them.
    pub fn on_link_error(&self, cb: impl Fn(&ClientError) + Send + Sync + 'static) {
        self.inner
            .error_hooks
            .lock()
            .expect("error hooks lock")
            .push(Arc::new(cb));
    }

    pub async fn heartbeat_stats(&self) -> HeartbeatStats {
        self.inner.heartbeat.lock().await.stats
    }
}

async fn run_supervisor(inner: Arc<SocketInner>) {
    loop {
        inner.set_state(LinkState::Connecting);
        match connect_async(&inner.url).await {
            Ok((ws, _)) => {
                inner.reconnect_attempts.store(0, Ordering::SeqCst);
                run_connection(&inner, ws).await;
            }
            Err(e) => {
                warn!(error = %e, "connect failed");
                inner.report_error(&ClientError::Connect(e.to_string()));
                inner.set_state(LinkState::Closed);
            }
        }

        if inner.manually_closed.load(Ordering::SeqCst) {
            debug!("manual disconnect, supervisor exiting");
            return;
        }
        let attempt = inner.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = (inner.options.reconnect_schedule)(attempt);
        info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::time::sleep(delay).await;
        if inner.manually_closed.load(Ordering::SeqCst) {
            return;
        }
    }
}

async fn run_connection(inner: &Arc<SocketInner>, ws: WsStream) {
    let (mut sink, mut stream) = ws.split();
    let (writer_tx, mut writer_rx) = mpsc::channel::<Message>(WRITER_CAP);
    *inner.writer.write().await = Some(writer_tx);

    let writer_task = tokio::spawn(async move {
        while let Some(msg) = writer_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    inner.set_state(LinkState::Open);
    info!("link open");
    inner.flush_buffer().await;

    let channels: Vec<Arc<Channel>> = inner.channels.read().await.values().cloned().collect();
    for channel in &channels {
        channel.on_link_open();
    }

    run_link(inner, &mut stream).await;

    *inner.writer.write().await = None;
    if inner.link_state() != LinkState::Closing {
        inner.set_state(LinkState::Closed);
    }
    inner.pending.fail_all();
    inner.heartbeat.lock().await.outstanding = None;
    if let Some(hook) = &inner.options.heartbeat_hook {
        hook(HeartbeatStatus::Disconnected);
    }
    let channels: Vec<Arc<Channel>> = inner.channels.read().await.values().cloned().collect();
    for channel in &channels {
        channel.on_link_close();
    }
    writer_task.abort();
    info!("link closed");
}

async fn run_link(inner: &Arc<SocketInner>, stream: &mut SplitStream<WsStream>) {
    let mut heartbeat = tokio::time::interval(inner.options.heartbeat_interval);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => inner.route_text(text.as_str()).await,
                Some(Ok(Message::Ping(data))) => {
                    inner.send_raw(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("close frame from server");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "link read error");
                    inner.report_error(&ClientError::Ws(e.to_string()));
                    break;
                }
                None => break,
            },
            _ = heartbeat.tick() => {
                if !inner.heartbeat_tick().await {
                    break;
                }
            }
        }
    }
}

fn build_url(url: &str, client_id: Option<&str>) -> Result<String, ClientError> {
    let mut parsed = Url::parse(url)?;
    let scheme = match parsed.scheme() {
        "ws" | "wss" => None,
        "http" => Some("ws"),
        "https" => Some("wss"),
        other => {
            return Err(ClientError::Connect(format!("unsupported scheme: {other}")));
        }
    };
    if let Some(scheme) = scheme {
        parsed
            .set_scheme(scheme)
            .map_err(|()| ClientError::Connect("scheme rewrite failed".to_owned()))?;
    }
    if let Some(client_id) = client_id {
        parsed.query_pairs_mut().append_pair("client_id", client_id);
    }
    Ok(parsed.into())
}
