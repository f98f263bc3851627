//! Outbound frame construction helpers.
//!
//! Everything the server writes goes through these, so the frame shapes stay
//! in one place.  Encoding a `serde_json`-built payload cannot realistically
//! fail; a `None` is logged at the call site and the frame skipped.

use rb_protocol::{
    BroadcastPayload, EventKind, Frame, PresenceDiff, PresenceMap, ReplyPayload,
};

pub fn reply_text(seq: &str, topic: &str, payload: ReplyPayload) -> Option<String> {
    Frame::reply(seq.to_owned(), topic, payload).encode().ok()
}

pub fn broadcast_text(topic: &str, message: &BroadcastPayload) -> Option<String> {
    let payload = serde_json::to_value(message).ok()?;
    Frame::push(topic, EventKind::Broadcast, payload).encode().ok()
}

pub fn presence_state_text(topic: &str, state: &PresenceMap) -> Option<String> {
    let payload = serde_json::to_value(state).ok()?;
    Frame::push(topic, EventKind::PresenceState, payload)
        .encode()
        .ok()
}

pub fn presence_diff_text(topic: &str, diff: &PresenceDiff) -> Option<String> {
    let payload = serde_json::to_value(diff).ok()?;
    Frame::push(topic, EventKind::PresenceDiff, payload)
        .encode()
        .ok()
}
