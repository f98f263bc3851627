//! The client channel: one topic's subscription state machine.
//!
//! States move `closed → joining → joined → leaving → closed`, with
//! `errored` entered on join failure, join timeout, or unexpected transport
//! close of an ever-joined channel.  Errored channels rejoin on their timer
//! (suppressed for auth failures, whose codes share the `AUTH_` prefix) or
//! immediately when the link reopens; a rejoin re-tracks the last tracked
//! presence meta.  Requests composed before the join completes queue in a
//! bounded per-channel buffer and drain on `joined`.

use crate::pending::ReplyOutcome;
use crate::presence::{PresenceCallback, PresenceSync, SyncCallback};
use crate::socket::{LinkState, SocketInner};
use rb_protocol::{
    BroadcastPayload, ChannelConfig, ErrorResponse, EventKind, Frame, JoinPayload,
    PresenceMap, PresenceRequest, TrackBody, error_codes, limits,
};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Joining,
    Joined,
    Leaving,
    Errored,
}

/// Terminal outcome of `subscribe`.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscribeStatus {
    Subscribed,
    TimedOut,
    Closed,
    ChannelError(ErrorResponse),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Ok,
    Error,
    Timeout,
}

/// Resolution of `send`, `track`, and `untrack`.
#[derive(Debug, Clone, PartialEq)]
pub struct SendOutcome {
    pub status: SendStatus,
    pub code: Option<String>,
    pub reason: Option<String>,
    /// Milliseconds to wait, on `MESSAGE_RATE_LIMITED`.  Surfaced to the
    /// caller; the client never retries on its own.
    pub retry_after: Option<u64>,
}

impl SendOutcome {
    fn ok() -> Self {
        SendOutcome {
            status: SendStatus::Ok,
            code: None,
            reason: None,
            retry_after: None,
        }
    }

    fn timeout() -> Self {
        SendOutcome {
            status: SendStatus::Timeout,
            code: None,
            reason: None,
            retry_after: None,
        }
    }

    fn from_outcome(outcome: ReplyOutcome) -> Self {
        match outcome {
            ReplyOutcome::Ok(_) => SendOutcome::ok(),
            ReplyOutcome::Error(response) => {
                let detail = parse_error(&response);
                SendOutcome {
                    status: SendStatus::Error,
                    retry_after: detail.retry_after,
                    code: detail.code,
                    reason: Some(detail.reason),
                }
            }
            ReplyOutcome::Timeout | ReplyOutcome::Disconnected => SendOutcome::timeout(),
        }
    }
}

/// Resolution of `unsubscribe` / `remove_channel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveStatus {
    Ok,
    Error,
    TimedOut,
}

struct BroadcastBinding {
    /// `None` is the wildcard: every broadcast event.
    event: Option<String>,
    cb: Arc<dyn Fn(&str, &Value) + Send + Sync>,
}

pub type SystemErrorCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// A request composed before the channel reached `joined`.
enum QueuedRequest {
    Broadcast {
        message: BroadcastPayload,
        reply: Option<oneshot::Sender<ReplyOutcome>>,
    },
    Presence {
        request: PresenceRequest,
        reply: oneshot::Sender<ReplyOutcome>,
    },
}

pub struct Channel {
    topic: String,
    config: ChannelConfig,
    socket: Weak<SocketInner>,
    self_weak: Weak<Channel>,
    state_tx: watch::Sender<ChannelState>,
    join_seq: Mutex<Option<String>>,
    was_joined: AtomicBool,
    /// Meta re-tracked after a rejoin; cleared by `untrack`/`unsubscribe`.
    tracked_meta: Mutex<Option<Value>>,
    prejoin: Mutex<VecDeque<QueuedRequest>>,
    broadcasts: Mutex<Vec<BroadcastBinding>>,
    error_listeners: Mutex<Vec<SystemErrorCallback>>,
    presence: PresenceSync,
    join_lock: tokio::sync::Mutex<()>,
    rejoin_attempts: AtomicU32,
    rejoin_task: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    pub(crate) fn new(
        topic: String,
        config: ChannelConfig,
        socket: Weak<SocketInner>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Channel {
            topic,
            config,
            socket,
            self_weak: self_weak.clone(),
            state_tx: watch::channel(ChannelState::Closed).0,
            join_seq: Mutex::new(None),
            was_joined: AtomicBool::new(false),
            tracked_meta: Mutex::new(None),
            prejoin: Mutex::new(VecDeque::new()),
            broadcasts: Mutex::new(Vec::new()),
            error_listeners: Mutex::new(Vec::new()),
            presence: PresenceSync::new(),
            join_lock: tokio::sync::Mutex::new(()),
            rejoin_attempts: AtomicU32::new(0),
            rejoin_task: Mutex::new(None),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    pub fn on_state_change(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ChannelState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(topic = %self.topic, ?previous, ?state, "channel state");
        }
    }

    // -----------------------------------------------------------------------
    // Subscribe / unsubscribe
    // -----------------------------------------------------------------------

    /// Join the channel.  Resolves on the join reply, its timeout, or
    /// transport loss.  Subscribing an already-joined channel resolves
    /// `Subscribed` immediately without resending the join.
    pub async fn subscribe(&self) -> SubscribeStatus {
        if self.state() == ChannelState::Joined {
            return SubscribeStatus::Subscribed;
        }
        self.join_inner(false).await
    }

    async fn join_inner(&self, rejoin: bool) -> SubscribeStatus {
        let Some(socket) = self.socket.upgrade() else {
            return SubscribeStatus::Closed;
        };
        let _guard = self.join_lock.lock().await;
        if self.state() == ChannelState::Joined {
            return SubscribeStatus::Subscribed;
        }

        self.set_state(ChannelState::Joining);
        let access_token = socket.current_token().await;
        let payload = JoinPayload {
            config: self.config.clone(),
            access_token,
        };
        let payload = match serde_json::to_value(payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "join payload failed to encode");
                self.set_state(ChannelState::Errored);
                return SubscribeStatus::Closed;
            }
        };

        let seq = socket.next_seq();
        *self.join_seq.lock().expect("join_seq lock") = Some(seq.clone());
        let frame = Frame::new(
            Some(seq.clone()),
            Some(seq),
            &self.topic,
            EventKind::Join,
            payload,
        );

        let outcome = socket.request(frame, socket.options.request_timeout).await;
        if self.state() != ChannelState::Joining {
            // Unsubscribed or closed while the join was in flight.
            return SubscribeStatus::Closed;
        }
        match outcome {
            ReplyOutcome::Ok(_) => {
                self.set_state(ChannelState::Joined);
                self.was_joined.store(true, Ordering::SeqCst);
                self.rejoin_attempts.store(0, Ordering::SeqCst);
                info!(topic = %self.topic, rejoin, "channel joined");
                self.drain_prejoin().await;
                if rejoin {
                    let meta = self.tracked_meta.lock().expect("meta lock").clone();
                    if let Some(meta) = meta {
                        let _ = self
                            .presence_request(PresenceRequest::Track {
                                payload: TrackBody { meta },
                            })
                            .await;
                    }
                }
                SubscribeStatus::Subscribed
            }
            ReplyOutcome::Error(response) => {
                let detail = parse_error(&response);
                self.set_state(ChannelState::Errored);
                let auth_error = detail
                    .code
                    .as_deref()
                    .is_some_and(error_codes::is_auth_code);
                if auth_error {
                    info!(topic = %self.topic, code = ?detail.code, "join rejected, rejoin suppressed until credentials refresh");
                } else {
                    self.arm_rejoin();
                }
                SubscribeStatus::ChannelError(detail)
            }
            ReplyOutcome::Timeout => {
                self.set_state(ChannelState::Errored);
                self.arm_rejoin();
                SubscribeStatus::TimedOut
            }
            ReplyOutcome::Disconnected => {
                self.set_state(ChannelState::Errored);
                SubscribeStatus::Closed
            }
        }
    }

    pub async fn unsubscribe(&self) -> RemoveStatus {
        let timeout = match self.socket.upgrade() {
            Some(socket) => socket.options.request_timeout,
            None => std::time::Duration::from_secs(10),
        };
        self.unsubscribe_with_timeout(timeout).await
    }

    /// Leave the channel.  Whatever the reply outcome, the channel ends
    /// `closed` with auto-rejoin and saved presence meta cleared.
    pub async fn unsubscribe_with_timeout(&self, timeout: std::time::Duration) -> RemoveStatus {
        self.cancel_rejoin();
        self.was_joined.store(false, Ordering::SeqCst);
        *self.tracked_meta.lock().expect("meta lock") = None;
        self.prejoin.lock().expect("prejoin lock").clear();

        if self.state() != ChannelState::Joined {
            self.set_state(ChannelState::Closed);
            return RemoveStatus::Ok;
        }
        let Some(socket) = self.socket.upgrade() else {
            self.set_state(ChannelState::Closed);
            return RemoveStatus::Ok;
        };

        self.set_state(ChannelState::Leaving);
        let seq = socket.next_seq();
        let frame = Frame::new(
            self.join_seq.lock().expect("join_seq lock").clone(),
            Some(seq),
            &self.topic,
            EventKind::Leave,
            serde_json::Value::Object(serde_json::Map::new()),
        );
        let outcome = socket.request(frame, timeout).await;
        self.set_state(ChannelState::Closed);
        match outcome {
            ReplyOutcome::Ok(_) | ReplyOutcome::Disconnected => RemoveStatus::Ok,
            ReplyOutcome::Error(_) => RemoveStatus::Error,
            ReplyOutcome::Timeout => RemoveStatus::TimedOut,
        }
    }

    // -----------------------------------------------------------------------
    // Broadcasts
    // -----------------------------------------------------------------------

    /// Broadcast to the channel.  With `broadcast.ack` the outcome reflects
    /// the server reply; otherwise it resolves `ok` on enqueue.
    pub async fn send(&self, event: &str, payload: Value) -> SendOutcome {
        let message = BroadcastPayload::new(event, payload);
        let ack = self.config.broadcast.ack;

        if self.state() != ChannelState::Joined {
            if ack {
                let (tx, rx) = oneshot::channel();
                self.queue_prejoin(QueuedRequest::Broadcast {
                    message,
                    reply: Some(tx),
                });
                return SendOutcome::from_outcome(self.await_queued(rx).await);
            }
            self.queue_prejoin(QueuedRequest::Broadcast {
                message,
                reply: None,
            });
            return SendOutcome::ok();
        }

        if ack {
            let outcome = self
                .request_joined(EventKind::Broadcast, to_value(&message))
                .await;
            SendOutcome::from_outcome(outcome)
        } else {
            self.push_joined(EventKind::Broadcast, to_value(&message)).await;
            SendOutcome::ok()
        }
    }

    pub fn on_broadcast(&self, event: Option<&str>, cb: impl Fn(&str, &Value) + Send + Sync + 'static) {
        self.broadcasts
            .lock()
            .expect("broadcasts lock")
            .push(BroadcastBinding {
                event: event.map(ToOwned::to_owned),
                cb: Arc::new(cb),
            });
    }

    /// Unsolicited `chan:error` payloads from the server.
    pub fn on_error(&self, cb: impl Fn(&Value) + Send + Sync + 'static) {
        self.error_listeners
            .lock()
            .expect("error listeners lock")
            .push(Arc::new(cb));
    }

    // -----------------------------------------------------------------------
    // Presence
    // -----------------------------------------------------------------------

    /// Track this member's presence.  The meta is saved and re-tracked
    /// automatically after a reconnect rejoin.
    pub async fn track(&self, meta: Value) -> SendOutcome {
        *self.tracked_meta.lock().expect("meta lock") = Some(meta.clone());
        self.presence_request(PresenceRequest::Track {
            payload: TrackBody { meta },
        })
        .await
    }

    pub async fn untrack(&self) -> SendOutcome {
        *self.tracked_meta.lock().expect("meta lock") = None;
        self.presence_request(PresenceRequest::Untrack {}).await
    }

    async fn presence_request(&self, request: PresenceRequest) -> SendOutcome {
        if self.state() != ChannelState::Joined {
            let (tx, rx) = oneshot::channel();
            self.queue_prejoin(QueuedRequest::Presence { request, reply: tx });
            return SendOutcome::from_outcome(self.await_queued(rx).await);
        }
        let outcome = self
            .request_joined(EventKind::Presence, to_value(&request))
            .await;
        SendOutcome::from_outcome(outcome)
    }

    /// Await a queued request's eventual outcome.  A request that never
    /// drains (the channel never reaches `joined`) surfaces as a timeout.
    async fn await_queued(&self, rx: oneshot::Receiver<ReplyOutcome>) -> ReplyOutcome {
        let deadline = match self.socket.upgrade() {
            Some(socket) => socket.options.request_timeout,
            None => std::time::Duration::from_secs(10),
        };
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => ReplyOutcome::Timeout,
            Err(_) => ReplyOutcome::Timeout,
        }
    }

    pub fn presence_state(&self) -> PresenceMap {
        self.presence.state()
    }

    pub fn on_presence_sync(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.presence.on_sync(Arc::new(cb) as SyncCallback);
    }

    pub fn on_presence_join(
        &self,
        cb: impl Fn(&str, &[rb_protocol::PresenceEntry], &[rb_protocol::PresenceEntry]) + Send + Sync + 'static,
    ) {
        self.presence.on_join(Arc::new(cb) as PresenceCallback);
    }

    pub fn on_presence_leave(
        &self,
        cb: impl Fn(&str, &[rb_protocol::PresenceEntry], &[rb_protocol::PresenceEntry]) + Send + Sync + 'static,
    ) {
        self.presence.on_leave(Arc::new(cb) as PresenceCallback);
    }

    // -----------------------------------------------------------------------
    // Link lifecycle (called by the socket)
    // -----------------------------------------------------------------------

    pub(crate) fn on_link_open(self: &Arc<Self>) {
        if !self.was_joined.load(Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _ = this.join_inner(true).await;
        });
    }

    pub(crate) fn on_link_close(&self) {
        self.cancel_rejoin();
        let state = self.state();
        if self.was_joined.load(Ordering::SeqCst)
            && state != ChannelState::Closed
            && state != ChannelState::Leaving
        {
            self.set_state(ChannelState::Errored);
        }
    }

    // -----------------------------------------------------------------------
    // Inbound push frames (called by the socket's read loop)
    // -----------------------------------------------------------------------

    pub(crate) fn handle_frame(&self, frame: Frame) {
        match frame.event_kind() {
            Some(EventKind::Broadcast) => {
                let Ok(message) = serde_json::from_value::<BroadcastPayload>(frame.payload) else {
                    debug!(topic = %self.topic, "malformed broadcast dropped");
                    return;
                };
                let matched: Vec<_> = self
                    .broadcasts
                    .lock()
                    .expect("broadcasts lock")
                    .iter()
                    .filter(|binding| {
                        binding
                            .event
                            .as_deref()
                            .is_none_or(|event| event == message.event)
                    })
                    .map(|binding| Arc::clone(&binding.cb))
                    .collect();
                for cb in matched {
                    cb(&message.event, &message.payload);
                }
            }
            Some(EventKind::PresenceState) => {
                match serde_json::from_value::<PresenceMap>(frame.payload) {
                    Ok(snapshot) => self.presence.apply_snapshot(snapshot),
                    Err(e) => debug!(topic = %self.topic, error = %e, "malformed presence snapshot dropped"),
                }
            }
            Some(EventKind::PresenceDiff) => {
                match serde_json::from_value::<rb_protocol::PresenceDiff>(frame.payload) {
                    Ok(diff) => self.presence.apply_diff(&diff),
                    Err(e) => debug!(topic = %self.topic, error = %e, "malformed presence diff dropped"),
                }
            }
            Some(EventKind::Close) => {
                info!(topic = %self.topic, "closed by server");
                self.cancel_rejoin();
                self.was_joined.store(false, Ordering::SeqCst);
                self.set_state(ChannelState::Closed);
            }
            Some(EventKind::Error) => {
                warn!(topic = %self.topic, "channel error from server");
                let listeners: Vec<_> = self
                    .error_listeners
                    .lock()
                    .expect("error listeners lock")
                    .clone();
                for cb in listeners {
                    cb(&frame.payload);
                }
            }
            _ => {
                debug!(topic = %self.topic, event = %frame.event, "unhandled channel frame dropped");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn queue_prejoin(&self, request: QueuedRequest) {
        let mut queue = self.prejoin.lock().expect("prejoin lock");
        if queue.len() >= limits::PREJOIN_BUFFER_CAP {
            queue.pop_front();
            debug!(topic = %self.topic, "pre-join buffer full, dropped oldest request");
        }
        queue.push_back(request);
    }

    async fn drain_prejoin(&self) {
        loop {
            let Some(request) = self.prejoin.lock().expect("prejoin lock").pop_front() else {
                return;
            };
            match request {
                QueuedRequest::Broadcast { message, reply } => {
                    let payload = to_value(&message);
                    match reply {
                        Some(tx) => {
                            let outcome =
                                self.request_joined(EventKind::Broadcast, payload).await;
                            let _ = tx.send(outcome);
                        }
                        None => self.push_joined(EventKind::Broadcast, payload).await,
                    }
                }
                QueuedRequest::Presence { request, reply } => {
                    let outcome = self
                        .request_joined(EventKind::Presence, to_value(&request))
                        .await;
                    let _ = reply.send(outcome);
                }
            }
        }
    }

    async fn request_joined(&self, event: EventKind, payload: Value) -> ReplyOutcome {
        let Some(socket) = self.socket.upgrade() else {
            return ReplyOutcome::Disconnected;
        };
        let seq = socket.next_seq();
        let frame = Frame::new(
            self.join_seq.lock().expect("join_seq lock").clone(),
            Some(seq),
            &self.topic,
            event,
            payload,
        );
        socket.request(frame, socket.options.request_timeout).await
    }

    async fn push_joined(&self, event: EventKind, payload: Value) {
        let Some(socket) = self.socket.upgrade() else {
            return;
        };
        let frame = Frame::new(
            self.join_seq.lock().expect("join_seq lock").clone(),
            None,
            &self.topic,
            event,
            payload,
        );
        match frame.encode() {
            Ok(text) => socket.transmit(text).await,
            Err(e) => warn!(topic = %self.topic, error = %e, "frame failed to encode"),
        }
    }

    fn arm_rejoin(&self) {
        let Some(this) = self.self_weak.upgrade() else {
            return;
        };
        let Some(socket) = self.socket.upgrade() else {
            return;
        };
        let attempt = self.rejoin_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = (socket.options.reconnect_schedule)(attempt);
        debug!(topic = %self.topic, attempt, delay_ms = delay.as_millis() as u64, "rejoin armed");

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if this.state() != ChannelState::Errored {
                return;
            }
            let Some(socket) = this.socket.upgrade() else {
                return;
            };
            // A closed link rejoins via the link-open notification instead.
            if socket.link_state() != LinkState::Open {
                return;
            }
            let _ = this.join_inner(true).await;
        });
        let previous = self
            .rejoin_task
            .lock()
            .expect("rejoin task lock")
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn cancel_rejoin(&self) {
        if let Some(task) = self.rejoin_task.lock().expect("rejoin task lock").take() {
            task.abort();
        }
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn parse_error(response: &Value) -> ErrorResponse {
    serde_json::from_value(response.clone()).unwrap_or_else(|_| ErrorResponse {
        reason: response
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_owned(),
        code: None,
        retry_after: None,
    })
}
