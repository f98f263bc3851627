//! Inbound frame routing.
//!
//! Frames from one link are handled strictly in arrival order by the link's
//! read loop.  Every reply goes back through the sender's outbox; protocol
//! violations answer with a machine-readable error reply when the frame was
//! a request, and are logged and dropped otherwise.  Nothing in here closes
//! the link.

use rb_protocol::{
    BroadcastPayload, ChannelConfig, EventKind, Frame, JoinPayload, PresenceRequest, ReplyPayload,
    SYSTEM_TOPIC, error_codes, limits,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::channels::{ChannelMember, JoinError};
use crate::presence::{PresenceOwner, TrackError};
use crate::state::{AppState, ConnId, Outbox};
use crate::wire;

/// Broadcasts allowed per connection within one rate window.
const BROADCAST_RATE_LIMIT: u32 = 100;
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Per-connection handler state, owned by the link's read loop.
pub struct ConnContext {
    pub conn_id: ConnId,
    pub client_id: String,
    pub outbox: Outbox,
    /// Token last supplied via an `access_token` frame; fallback for joins
    /// whose payload carries none.
    access_token: Option<String>,
    rate: RateWindow,
}

impl ConnContext {
    pub fn new(conn_id: ConnId, client_id: String, outbox: Outbox) -> Self {
        ConnContext {
            conn_id,
            client_id,
            outbox,
            access_token: None,
            rate: RateWindow::new(),
        }
    }

    fn reply(&self, seq: &str, topic: &str, payload: ReplyPayload) {
        if let Some(text) = wire::reply_text(seq, topic, payload) {
            self.outbox.send_text(&text);
        }
    }
}

struct RateWindow {
    window_start: Instant,
    count: u32,
}

impl RateWindow {
    fn new() -> Self {
        RateWindow {
            window_start: Instant::now(),
            count: 0,
        }
    }

    /// Admit one broadcast, or return the milliseconds until the window
    /// reopens.
    fn admit(&mut self) -> Result<(), u64> {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= RATE_WINDOW {
            self.window_start = now;
            self.count = 0;
        }
        if self.count >= BROADCAST_RATE_LIMIT {
            let elapsed = now.duration_since(self.window_start);
            let remaining = RATE_WINDOW.saturating_sub(elapsed);
            return Err(remaining.as_millis().max(1) as u64);
        }
        self.count += 1;
        Ok(())
    }
}

pub async fn handle_frame(state: &AppState, ctx: &mut ConnContext, frame: Frame, raw_len: usize) {
    let Some(kind) = frame.event_kind() else {
        warn!(conn_id = %ctx.conn_id, event = %frame.event, "unknown event, dropping frame");
        return;
    };

    if raw_len > limits::MAX_MESSAGE_BYTES {
        if let Some(seq) = &frame.seq {
            ctx.reply(
                seq,
                &frame.topic,
                ReplyPayload::error(error_codes::MESSAGE_TOO_LARGE, "message exceeds size limit"),
            );
        } else {
            debug!(conn_id = %ctx.conn_id, "oversize fire-and-forget frame dropped");
        }
        return;
    }

    match kind {
        EventKind::Heartbeat => handle_heartbeat(ctx, &frame),
        EventKind::Join => handle_join(state, ctx, &frame).await,
        EventKind::Leave => handle_leave(state, ctx, &frame).await,
        EventKind::Broadcast => handle_broadcast(state, ctx, &frame).await,
        EventKind::Presence => handle_presence(state, ctx, &frame).await,
        EventKind::AccessToken => handle_access_token(ctx, &frame),
        EventKind::Reply | EventKind::Close | EventKind::Error => {
            debug!(conn_id = %ctx.conn_id, event = %frame.event, "server-emitted event from client, dropping");
        }
        EventKind::PresenceState | EventKind::PresenceDiff => {
            debug!(conn_id = %ctx.conn_id, event = %frame.event, "presence emission from client, dropping");
        }
    }
}

fn handle_heartbeat(ctx: &ConnContext, frame: &Frame) {
    if frame.topic != SYSTEM_TOPIC {
        debug!(conn_id = %ctx.conn_id, topic = %frame.topic, "heartbeat off the system topic, dropping");
        return;
    }
    if let Some(seq) = &frame.seq {
        ctx.reply(seq, SYSTEM_TOPIC, ReplyPayload::ok(json!({})));
    }
}

fn handle_access_token(ctx: &mut ConnContext, frame: &Frame) {
    if let Some(token) = frame
        .payload
        .get("access_token")
        .and_then(Value::as_str)
    {
        ctx.access_token = Some(token.to_owned());
        if let Some(seq) = &frame.seq {
            ctx.reply(seq, &frame.topic, ReplyPayload::ok(json!({})));
        }
    } else if let Some(seq) = &frame.seq {
        ctx.reply(
            seq,
            &frame.topic,
            ReplyPayload::error(error_codes::MESSAGE_MALFORMED, "missing access_token"),
        );
    }
}

async fn handle_join(state: &AppState, ctx: &mut ConnContext, frame: &Frame) {
    let Some(seq) = frame.seq.clone() else {
        debug!(conn_id = %ctx.conn_id, "join without a sequence, dropping");
        return;
    };
    let topic = &frame.topic;

    if topic.len() > limits::MAX_TOPIC_LEN {
        ctx.reply(
            &seq,
            topic,
            ReplyPayload::error(error_codes::MESSAGE_MALFORMED, "topic name too long"),
        );
        return;
    }
    if topic == SYSTEM_TOPIC {
        ctx.reply(
            &seq,
            topic,
            ReplyPayload::error(error_codes::CHANNEL_FORBIDDEN, "reserved topic"),
        );
        return;
    }

    let payload: JoinPayload = match serde_json::from_value(frame.payload.clone()) {
        Ok(payload) => payload,
        Err(e) => {
            ctx.reply(
                &seq,
                topic,
                ReplyPayload::error(error_codes::MESSAGE_MALFORMED, &format!("bad join payload: {e}")),
            );
            return;
        }
    };

    if let Some(verifier) = &state.auth {
        let token = payload
            .access_token
            .clone()
            .or_else(|| ctx.access_token.clone());
        let Some(token) = token else {
            ctx.reply(
                &seq,
                topic,
                ReplyPayload::error(error_codes::AUTH_MISSING, "access token required"),
            );
            return;
        };
        let claims = match verifier.verify(&token) {
            Ok(claims) => claims,
            Err(failure) => {
                info!(conn_id = %ctx.conn_id, topic = %topic, code = failure.code, "join rejected");
                ctx.reply(&seq, topic, ReplyPayload::error(failure.code, &failure.reason));
                return;
            }
        };
        if !crate::auth::AuthVerifier::can_access_channel(&claims, topic) {
            ctx.reply(
                &seq,
                topic,
                ReplyPayload::error(error_codes::AUTH_CHANNEL_DENIED, "channel not permitted"),
            );
            return;
        }
    }

    let config = normalize_config(payload.config);
    let member = ChannelMember {
        outbox: ctx.outbox.clone(),
        client_id: ctx.client_id.clone(),
        join_seq: Some(seq.clone()),
        config: config.clone(),
    };
    if let Err(e) = state.channels.join(topic, ctx.conn_id, member).await {
        let reply = match e {
            JoinError::AlreadyJoined => ReplyPayload::error(
                error_codes::CHANNEL_ALREADY_JOINED,
                "already a member of this channel",
            ),
            JoinError::ChannelFull => {
                ReplyPayload::error(error_codes::CHANNEL_FULL, "channel member limit reached")
            }
            JoinError::SubscriptionLimit => ReplyPayload::error(
                error_codes::CHANNEL_FULL,
                "subscription limit reached for this connection",
            ),
        };
        ctx.reply(&seq, topic, reply);
        return;
    }
    info!(conn_id = %ctx.conn_id, client_id = %ctx.client_id, topic = %topic, "joined channel");
    ctx.reply(&seq, topic, ReplyPayload::ok(json!({})));

    // The joiner sees the authoritative snapshot before any peer diff can
    // reach it: both go through the same outbox.
    if config.presence.is_active() {
        let snapshot = state.presence.snapshot(topic).await;
        if let Some(text) = wire::presence_state_text(topic, &snapshot) {
            ctx.outbox.send_text(&text);
        }
    }

    if let Some(fabric) = &state.fabric {
        fabric
            .ensure_subscribed(topic, Arc::clone(&state.channels), Arc::clone(&state.presence))
            .await;
    }
}

async fn handle_leave(state: &AppState, ctx: &ConnContext, frame: &Frame) {
    let topic = &frame.topic;

    // Untrack before dropping the membership so the leave diff reflects the
    // departing presence; it fans out after removal, reaching peers only.
    let mut diff_text = None;
    if let Some(member) = state.channels.member(topic, ctx.conn_id).await {
        if let Some(key) = presence_key(&member.config) {
            let owner = PresenceOwner::Local(ctx.conn_id);
            if let Some(diff) = state.presence.untrack(topic, &key, &owner).await {
                publish_untracks(state, topic, &diff).await;
                diff_text = wire::presence_diff_text(topic, &diff);
            }
        }
    }

    let outcome = state.channels.leave(topic, ctx.conn_id).await;
    if outcome.removed {
        info!(conn_id = %ctx.conn_id, topic = %topic, "left channel");
    }
    if let Some(text) = diff_text {
        state.channels.fan_out(topic, &text, None).await;
    }
    if outcome.emptied {
        state.presence.clear_topic(topic).await;
        if let Some(fabric) = &state.fabric {
            fabric.release(topic).await;
        }
    }
    if let Some(seq) = &frame.seq {
        ctx.reply(seq, topic, ReplyPayload::ok(json!({})));
    }
}

async fn handle_broadcast(state: &AppState, ctx: &mut ConnContext, frame: &Frame) {
    let topic = &frame.topic;
    let Some(member) = state.channels.member(topic, ctx.conn_id).await else {
        if let Some(seq) = &frame.seq {
            ctx.reply(
                seq,
                topic,
                ReplyPayload::error(error_codes::CHANNEL_FORBIDDEN, "not a member of this channel"),
            );
        }
        return;
    };

    if let Err(retry_after) = ctx.rate.admit() {
        if let Some(seq) = &frame.seq {
            ctx.reply(
                seq,
                topic,
                ReplyPayload::rate_limited("broadcast rate limit exceeded", retry_after),
            );
        }
        return;
    }

    let message: BroadcastPayload = match serde_json::from_value(frame.payload.clone()) {
        Ok(message) => message,
        Err(e) => {
            if let Some(seq) = &frame.seq {
                ctx.reply(
                    seq,
                    topic,
                    ReplyPayload::error(
                        error_codes::MESSAGE_MALFORMED,
                        &format!("bad broadcast payload: {e}"),
                    ),
                );
            }
            return;
        }
    };
    if message.kind != "broadcast" {
        if let Some(seq) = &frame.seq {
            ctx.reply(
                seq,
                topic,
                ReplyPayload::error(error_codes::MESSAGE_MALFORMED, "payload type must be broadcast"),
            );
        }
        return;
    }
    if message.event.len() > limits::MAX_EVENT_LEN {
        if let Some(seq) = &frame.seq {
            ctx.reply(
                seq,
                topic,
                ReplyPayload::error(error_codes::MESSAGE_MALFORMED, "event name too long"),
            );
        }
        return;
    }

    let skip = if member.config.broadcast.echo_self {
        None
    } else {
        Some(ctx.conn_id)
    };
    if let Some(text) = wire::broadcast_text(topic, &message) {
        state.channels.fan_out(topic, &text, skip).await;
    }
    if let Some(fabric) = &state.fabric {
        fabric
            .publish_broadcast(topic, &message, &ctx.client_id)
            .await;
    }

    if member.config.broadcast.ack {
        if let Some(seq) = &frame.seq {
            ctx.reply(seq, topic, ReplyPayload::ok(json!({})));
        }
    }
}

async fn handle_presence(state: &AppState, ctx: &ConnContext, frame: &Frame) {
    let topic = &frame.topic;
    let Some(seq) = frame.seq.clone() else {
        debug!(conn_id = %ctx.conn_id, "presence request without a sequence, dropping");
        return;
    };
    let Some(member) = state.channels.member(topic, ctx.conn_id).await else {
        ctx.reply(
            &seq,
            topic,
            ReplyPayload::error(error_codes::CHANNEL_FORBIDDEN, "not a member of this channel"),
        );
        return;
    };
    if !member.config.presence.is_active() {
        ctx.reply(
            &seq,
            topic,
            ReplyPayload::error(error_codes::PRESENCE_DISABLED, "presence disabled for this channel"),
        );
        return;
    }
    let Some(key) = presence_key(&member.config) else {
        ctx.reply(
            &seq,
            topic,
            ReplyPayload::error(
                error_codes::PRESENCE_KEY_CONFLICT,
                "no presence key declared for this subscription",
            ),
        );
        return;
    };

    let request: PresenceRequest = match serde_json::from_value(frame.payload.clone()) {
        Ok(request) => request,
        Err(e) => {
            ctx.reply(
                &seq,
                topic,
                ReplyPayload::error(
                    error_codes::MESSAGE_MALFORMED,
                    &format!("bad presence payload: {e}"),
                ),
            );
            return;
        }
    };

    match request {
        PresenceRequest::Track { payload } => {
            let meta_len = serde_json::to_vec(&payload.meta).map(|v| v.len()).unwrap_or(0);
            if meta_len > limits::MAX_PRESENCE_BYTES {
                ctx.reply(
                    &seq,
                    topic,
                    ReplyPayload::error(error_codes::PRESENCE_TOO_LARGE, "presence meta too large"),
                );
                return;
            }

            let owner = PresenceOwner::Local(ctx.conn_id);
            match state
                .presence
                .track(topic, &key, owner, payload.meta.clone())
                .await
            {
                Ok(outcome) => {
                    if let Some(text) = wire::presence_diff_text(topic, &outcome.diff) {
                        state.channels.fan_out(topic, &text, None).await;
                    }
                    if let Some(fabric) = &state.fabric {
                        fabric
                            .publish_track(topic, &key, &outcome.presence_ref, payload.meta)
                            .await;
                    }
                    ctx.reply(&seq, topic, ReplyPayload::ok(json!({})));
                }
                Err(TrackError::LimitReached) => {
                    ctx.reply(
                        &seq,
                        topic,
                        ReplyPayload::error(error_codes::CHANNEL_FULL, "presence entry limit reached"),
                    );
                }
            }
        }
        PresenceRequest::Untrack {} => {
            let owner = PresenceOwner::Local(ctx.conn_id);
            if let Some(diff) = state.presence.untrack(topic, &key, &owner).await {
                if let Some(text) = wire::presence_diff_text(topic, &diff) {
                    state.channels.fan_out(topic, &text, None).await;
                }
                publish_untracks(state, topic, &diff).await;
            }
            ctx.reply(&seq, topic, ReplyPayload::ok(json!({})));
        }
    }
}

/// Relay every leave in a diff as a fabric untrack.
async fn publish_untracks(state: &AppState, topic: &str, diff: &rb_protocol::PresenceDiff) {
    let Some(fabric) = &state.fabric else {
        return;
    };
    for (key, entries) in &diff.leaves {
        for entry in entries {
            fabric.publish_untrack(topic, key, &entry.presence_ref).await;
        }
    }
}

fn presence_key(config: &ChannelConfig) -> Option<String> {
    if !config.presence.is_active() {
        return None;
    }
    config
        .presence
        .key
        .as_deref()
        .filter(|k| !k.is_empty())
        .map(ToOwned::to_owned)
}

/// A presence key with no explicit `enabled` flag still activates presence.
fn normalize_config(config: ChannelConfig) -> ChannelConfig {
    let mut config = config;
    if config.presence.is_active() {
        config.presence.enabled = true;
    }
    config
}
