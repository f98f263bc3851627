// rb-protocol: wire protocol types and framing for the relaybus message bus.
//
// Every message on the link is a single JSON text frame holding an ordered
// 5-tuple: `[join_seq, seq, topic, event, payload]`.  `join_seq` and `seq`
// are nullable strings; a non-null `seq` marks a request expecting a reply
// (or the reply referencing it), a null `seq` marks fire-and-forget traffic
// such as fanned-out broadcasts and presence diffs.

use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Reserved names
// ---------------------------------------------------------------------------

/// Topic reserved for transport-level messages (heartbeats and their replies).
pub const SYSTEM_TOPIC: &str = "$system";

/// Sender identity stamped on broadcasts injected through the REST surface.
pub const API_SENDER: &str = "api";

// ---------------------------------------------------------------------------
// Protocol limits
// ---------------------------------------------------------------------------

/// Observable protocol limits.  Violations produce machine-readable error
/// replies; they never close the link.
pub mod limits {
    /// Maximum encoded frame size accepted on the wire.
    pub const MAX_MESSAGE_BYTES: usize = 100 * 1024;
    /// Maximum encoded presence meta size accepted by `track`.
    pub const MAX_PRESENCE_BYTES: usize = 10 * 1024;
    /// Maximum topic name length.
    pub const MAX_TOPIC_LEN: usize = 255;
    /// Maximum broadcast event name length.
    pub const MAX_EVENT_LEN: usize = 128;
    /// Maximum concurrent channel subscriptions per connection.
    pub const MAX_SUBSCRIPTIONS_PER_CONN: usize = 100;
    /// Maximum members per channel.
    pub const MAX_MEMBERS_PER_CHANNEL: usize = 10_000;
    /// Maximum presence entries per channel.
    pub const MAX_PRESENCE_PER_CHANNEL: usize = 1000;
    /// Socket-level send buffer capacity (frames queued while disconnected).
    pub const SEND_BUFFER_CAP: usize = 1000;
    /// Per-channel buffer for requests composed before the join completes.
    pub const PREJOIN_BUFFER_CAP: usize = 100;
}

// ---------------------------------------------------------------------------
// Event kinds
// ---------------------------------------------------------------------------

/// The handler selector carried in the fourth tuple slot.
///
/// The `Frame` keeps the raw string so unknown events can be logged and
/// dropped without failing the decode; routers parse into this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Join,
    Leave,
    Reply,
    Close,
    Error,
    AccessToken,
    Broadcast,
    Presence,
    PresenceState,
    PresenceDiff,
    Heartbeat,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Join => "chan:join",
            EventKind::Leave => "chan:leave",
            EventKind::Reply => "chan:reply",
            EventKind::Close => "chan:close",
            EventKind::Error => "chan:error",
            EventKind::AccessToken => "access_token",
            EventKind::Broadcast => "broadcast",
            EventKind::Presence => "presence",
            EventKind::PresenceState => "presence_state",
            EventKind::PresenceDiff => "presence_diff",
            EventKind::Heartbeat => "heartbeat",
        }
    }

    /// Parse a wire event name.  `None` means "unknown event": log and drop.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "chan:join" => EventKind::Join,
            "chan:leave" => EventKind::Leave,
            "chan:reply" => EventKind::Reply,
            "chan:close" => EventKind::Close,
            "chan:error" => EventKind::Error,
            "access_token" => EventKind::AccessToken,
            "broadcast" => EventKind::Broadcast,
            "presence" => EventKind::Presence,
            "presence_state" => EventKind::PresenceState,
            "presence_diff" => EventKind::PresenceDiff,
            "heartbeat" => EventKind::Heartbeat,
            _ => return None,
        })
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One wire frame: `[join_seq, seq, topic, event, payload]`.
///
/// `join_seq` is the sequence of the successful `chan:join` that established
/// the membership this frame belongs to; the server uses it to correlate
/// frames with a specific membership instance across rejoins.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub join_seq: Option<String>,
    pub seq: Option<String>,
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

impl Frame {
    pub fn new(
        join_seq: Option<String>,
        seq: Option<String>,
        topic: impl Into<String>,
        event: EventKind,
        payload: Value,
    ) -> Self {
        Frame {
            join_seq,
            seq,
            topic: topic.into(),
            event: event.as_str().to_owned(),
            payload,
        }
    }

    /// A fire-and-forget frame (`seq` and `join_seq` both null), as used for
    /// fanned-out broadcasts and presence snapshots/diffs.
    pub fn push(topic: impl Into<String>, event: EventKind, payload: Value) -> Self {
        Frame::new(None, None, topic, event, payload)
    }

    /// A reply frame referencing the request carrying `seq`.
    pub fn reply(seq: String, topic: impl Into<String>, payload: ReplyPayload) -> Self {
        Frame::new(
            None,
            Some(seq),
            topic,
            EventKind::Reply,
            serde_json::to_value(payload).unwrap_or(Value::Null),
        )
    }

    /// Parsed event kind; `None` for events this protocol version ignores.
    pub fn event_kind(&self) -> Option<EventKind> {
        EventKind::parse(&self.event)
    }

    /// Encode to a JSON text frame.
    pub fn encode(&self) -> Result<String, FrameEncodeError> {
        serde_json::to_string(self).map_err(|e| FrameEncodeError(e.to_string()))
    }

    /// Decode a JSON text frame.
    ///
    /// A `FrameDecodeError` is a "drop this frame" signal for the caller;
    /// it must never abort the link.
    pub fn decode(text: &str) -> Result<Frame, FrameDecodeError> {
        let value: Value =
            serde_json::from_str(text).map_err(|_| FrameDecodeError::InvalidJson)?;
        let Value::Array(items) = value else {
            return Err(FrameDecodeError::NotAnArray);
        };
        let [join_seq, seq, topic, event, payload]: [Value; 5] = items
            .try_into()
            .map_err(|items: Vec<Value>| FrameDecodeError::WrongArity(items.len()))?;
        let join_seq = nullable_string(join_seq)?;
        let seq = nullable_string(seq)?;
        let Value::String(topic) = topic else {
            return Err(FrameDecodeError::BadField("topic"));
        };
        let Value::String(event) = event else {
            return Err(FrameDecodeError::BadField("event"));
        };
        Ok(Frame {
            join_seq,
            seq,
            topic,
            event,
            payload,
        })
    }
}

fn nullable_string(v: Value) -> Result<Option<String>, FrameDecodeError> {
    match v {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        _ => Err(FrameDecodeError::BadField("seq")),
    }
}

impl Serialize for Frame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(5)?;
        tup.serialize_element(&self.join_seq)?;
        tup.serialize_element(&self.seq)?;
        tup.serialize_element(&self.topic)?;
        tup.serialize_element(&self.event)?;
        tup.serialize_element(&self.payload)?;
        tup.end()
    }
}

impl<'de> Deserialize<'de> for Frame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FrameVisitor;

        impl<'de> Visitor<'de> for FrameVisitor {
            type Value = Frame;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a 5-element [join_seq, seq, topic, event, payload] array")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Frame, A::Error> {
                let join_seq = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let msg_seq = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let topic = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                let event = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(3, &self))?;
                let payload = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(4, &self))?;
                if seq.next_element::<Value>()?.is_some() {
                    return Err(de::Error::invalid_length(6, &self));
                }
                Ok(Frame {
                    join_seq,
                    seq: msg_seq,
                    topic,
                    event,
                    payload,
                })
            }
        }

        deserializer.deserialize_tuple(5, FrameVisitor)
    }
}

/// Encoding failure (value not JSON-serializable).
#[derive(Debug, thiserror::Error)]
#[error("frame encode: {0}")]
pub struct FrameEncodeError(pub String);

/// Decoding failure.  Callers treat any variant as "drop the frame".
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("not valid JSON")]
    InvalidJson,
    #[error("not a JSON array")]
    NotAnArray,
    #[error("expected 5 elements, got {0}")]
    WrongArity(usize),
    #[error("bad field: {0}")]
    BadField(&'static str),
}

// ---------------------------------------------------------------------------
// Reply payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
}

/// Payload of a `chan:reply` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub status: ReplyStatus,
    #[serde(default)]
    pub response: Value,
}

impl ReplyPayload {
    pub fn ok(response: Value) -> Self {
        ReplyPayload {
            status: ReplyStatus::Ok,
            response,
        }
    }

    pub fn error(code: &str, reason: &str) -> Self {
        ReplyPayload {
            status: ReplyStatus::Error,
            response: serde_json::to_value(ErrorResponse {
                reason: reason.to_owned(),
                code: Some(code.to_owned()),
                retry_after: None,
            })
            .unwrap_or(Value::Null),
        }
    }

    /// Error reply carrying a rate-limit `retry_after` hint in milliseconds.
    pub fn rate_limited(reason: &str, retry_after_ms: u64) -> Self {
        ReplyPayload {
            status: ReplyStatus::Error,
            response: serde_json::to_value(ErrorResponse {
                reason: reason.to_owned(),
                code: Some(error_codes::MESSAGE_RATE_LIMITED.to_owned()),
                retry_after: Some(retry_after_ms),
            })
            .unwrap_or(Value::Null),
        }
    }

    /// Machine-readable error detail, if this is an error reply.
    pub fn error_response(&self) -> Option<ErrorResponse> {
        if self.status != ReplyStatus::Error {
            return None;
        }
        serde_json::from_value(self.response.clone()).ok()
    }
}

/// `response` body of an error reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Milliseconds to wait before retrying, on `MESSAGE_RATE_LIMITED`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

// ---------------------------------------------------------------------------
// Channel configuration
// ---------------------------------------------------------------------------

/// Per-subscription configuration carried in the `chan:join` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub broadcast: BroadcastOptions,
    #[serde(default)]
    pub presence: PresenceOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastOptions {
    /// Deliver the member's own broadcasts back to it.
    #[serde(rename = "self", default)]
    pub echo_self: bool,
    /// Request an ok reply for each broadcast instead of fire-and-forget.
    #[serde(default)]
    pub ack: bool,
}

impl Default for BroadcastOptions {
    fn default() -> Self {
        BroadcastOptions {
            echo_self: false,
            ack: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceOptions {
    /// Application-chosen presence key (e.g. a user id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub enabled: bool,
}

impl PresenceOptions {
    /// Presence participates when explicitly enabled or when a non-empty key
    /// was named.
    pub fn is_active(&self) -> bool {
        self.enabled || self.key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

/// `chan:join` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinPayload {
    #[serde(default)]
    pub config: ChannelConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

// ---------------------------------------------------------------------------
// Broadcast payloads
// ---------------------------------------------------------------------------

/// Payload of a `broadcast` frame, both client-originated and fanned out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastPayload {
    /// Always the literal `"broadcast"`.
    #[serde(rename = "type")]
    pub kind: String,
    pub event: String,
    pub payload: Value,
}

impl BroadcastPayload {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        BroadcastPayload {
            kind: "broadcast".to_owned(),
            event: event.into(),
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// Presence payloads
// ---------------------------------------------------------------------------

/// Client-originated `presence` frame payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum PresenceRequest {
    Track { payload: TrackBody },
    Untrack {},
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackBody {
    #[serde(default)]
    pub meta: Value,
}

/// One presence under a key.  Multiple entries per key represent the same
/// key tracked from multiple devices/sessions, disambiguated by
/// `presence_ref`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub presence_ref: String,
    #[serde(default)]
    pub meta: Value,
}

/// Key → ordered presences.  The `presence_state` payload is exactly this
/// map; `presence_diff` carries two of them.
pub type PresenceMap = HashMap<String, Vec<PresenceEntry>>;

/// Payload of a `presence_diff` frame.  `leaves` entries may omit `meta`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceDiff {
    #[serde(default)]
    pub joins: PresenceMap,
    #[serde(default)]
    pub leaves: PresenceMap,
}

impl PresenceDiff {
    pub fn is_empty(&self) -> bool {
        self.joins.is_empty() && self.leaves.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// Machine-readable error codes carried in error replies.
///
/// Codes in the auth family share the `AUTH_` prefix so clients can detect
/// them and suppress automatic rejoin (credentials will not heal on retry).
pub mod error_codes {
    pub const AUTH_PREFIX: &str = "AUTH_";

    pub const AUTH_MISSING: &str = "AUTH_MISSING";
    pub const AUTH_INVALID: &str = "AUTH_INVALID";
    pub const AUTH_EXPIRED: &str = "AUTH_EXPIRED";
    pub const AUTH_REVOKED: &str = "AUTH_REVOKED";
    pub const AUTH_SIGNATURE_INVALID: &str = "AUTH_SIGNATURE_INVALID";
    /// Token is valid but its claims do not permit this channel.
    pub const AUTH_CHANNEL_DENIED: &str = "AUTH_CHANNEL_DENIED";

    pub const CHANNEL_NOT_FOUND: &str = "CHANNEL_NOT_FOUND";
    pub const CHANNEL_FULL: &str = "CHANNEL_FULL";
    pub const CHANNEL_FORBIDDEN: &str = "CHANNEL_FORBIDDEN";
    pub const CHANNEL_ALREADY_JOINED: &str = "CHANNEL_ALREADY_JOINED";

    pub const MESSAGE_TOO_LARGE: &str = "MESSAGE_TOO_LARGE";
    pub const MESSAGE_MALFORMED: &str = "MESSAGE_MALFORMED";
    /// Reply includes `retry_after` in milliseconds.
    pub const MESSAGE_RATE_LIMITED: &str = "MESSAGE_RATE_LIMITED";

    pub const SYSTEM_OVERLOAD: &str = "SYSTEM_OVERLOAD";
    pub const SYSTEM_MAINTENANCE: &str = "SYSTEM_MAINTENANCE";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

    pub const PRESENCE_DISABLED: &str = "PRESENCE_DISABLED";
    pub const PRESENCE_TOO_LARGE: &str = "PRESENCE_TOO_LARGE";
    pub const PRESENCE_KEY_CONFLICT: &str = "PRESENCE_KEY_CONFLICT";

    /// True for codes that must suppress automatic rejoin.
    pub fn is_auth_code(code: &str) -> bool {
        code.starts_with(AUTH_PREFIX)
    }
}
