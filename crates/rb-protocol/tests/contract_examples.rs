/// Contract golden tests: load each JSON example file, decode it into a
/// frame, re-encode, and verify round-trip fidelity against the file.
///
/// The example files under `contracts/ws/v1/examples/` are the normative
/// wire shapes; server and client both speak exactly these.
use rb_protocol::{
    EventKind, Frame, JoinPayload, PresenceDiff, PresenceMap, PresenceRequest, ReplyPayload,
    ReplyStatus, SYSTEM_TOPIC, error_codes,
};
use serde_json::Value;

/// Helper: load a JSON example file and assert round-trip.
///
/// Returns the decoded frame so callers can inspect fields.
fn round_trip(relative_path: &str) -> Frame {
    // Example files live next to the workspace root, not the crate root.
    // Cargo sets CARGO_MANIFEST_DIR to the crate directory; we walk up two
    // levels to reach the workspace root.
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    let workspace_root = std::path::Path::new(manifest_dir)
        .parent()
        .expect("crates/")
        .parent()
        .expect("workspace root");

    let file_path = workspace_root.join(relative_path);
    let json_text = std::fs::read_to_string(&file_path)
        .unwrap_or_else(|e| panic!("Failed to read {}: {}", file_path.display(), e));

    let frame = Frame::decode(&json_text)
        .unwrap_or_else(|e| panic!("Failed to decode {}: {:?}", file_path.display(), e));

    let encoded = frame
        .encode()
        .unwrap_or_else(|e| panic!("Failed to encode {}: {}", file_path.display(), e));

    let original: Value = serde_json::from_str(&json_text).unwrap();
    let reencoded: Value = serde_json::from_str(&encoded).unwrap();
    assert_eq!(
        original,
        reencoded,
        "Round-trip mismatch for {}",
        file_path.display()
    );

    frame
}

#[test]
fn join_request_round_trip() {
    let frame = round_trip("contracts/ws/v1/examples/join_request.json");
    assert_eq!(frame.event_kind(), Some(EventKind::Join));
    assert!(frame.seq.is_some());

    let join: JoinPayload = serde_json::from_value(frame.payload).unwrap();
    assert!(join.access_token.is_some());
    assert!(join.config.presence.is_active());
}

#[test]
fn join_replies_round_trip() {
    let ok = round_trip("contracts/ws/v1/examples/join_ok_reply.json");
    let reply: ReplyPayload = serde_json::from_value(ok.payload).unwrap();
    assert_eq!(reply.status, ReplyStatus::Ok);

    let err = round_trip("contracts/ws/v1/examples/join_error_reply.json");
    let reply: ReplyPayload = serde_json::from_value(err.payload).unwrap();
    let detail = reply.error_response().expect("error detail");
    assert_eq!(detail.code.as_deref(), Some(error_codes::AUTH_EXPIRED));
    assert!(error_codes::is_auth_code(detail.code.as_deref().unwrap()));
}

#[test]
fn leave_request_carries_the_join_sequence() {
    let frame = round_trip("contracts/ws/v1/examples/leave_request.json");
    assert_eq!(frame.event_kind(), Some(EventKind::Leave));
    assert_eq!(frame.join_seq.as_deref(), Some("1"));
    assert_ne!(frame.join_seq, frame.seq);
}

#[test]
fn broadcast_request_and_fanout_round_trip() {
    let request = round_trip("contracts/ws/v1/examples/broadcast_request.json");
    assert_eq!(request.seq.as_deref(), Some("7"));

    let fanout = round_trip("contracts/ws/v1/examples/broadcast_fanout.json");
    assert_eq!(fanout.seq, None);
    assert_eq!(fanout.join_seq, None);
    // The fanned-out payload is the sender's, verbatim.
    assert_eq!(request.payload, fanout.payload);
}

#[test]
fn presence_requests_round_trip() {
    let track = round_trip("contracts/ws/v1/examples/presence_track.json");
    match serde_json::from_value::<PresenceRequest>(track.payload).unwrap() {
        PresenceRequest::Track { payload } => {
            assert_eq!(payload.meta["status"], "online");
        }
        PresenceRequest::Untrack {} => panic!("expected track"),
    }

    let untrack = round_trip("contracts/ws/v1/examples/presence_untrack.json");
    assert!(matches!(
        serde_json::from_value::<PresenceRequest>(untrack.payload).unwrap(),
        PresenceRequest::Untrack {}
    ));
}

#[test]
fn presence_state_round_trip() {
    let frame = round_trip("contracts/ws/v1/examples/presence_state.json");
    assert_eq!(frame.event_kind(), Some(EventKind::PresenceState));
    let state: PresenceMap = serde_json::from_value(frame.payload).unwrap();
    assert_eq!(state["alice"].len(), 1);
}

#[test]
fn presence_diff_round_trip() {
    let frame = round_trip("contracts/ws/v1/examples/presence_diff.json");
    let diff: PresenceDiff = serde_json::from_value(frame.payload).unwrap();
    assert_eq!(diff.joins["bob"].len(), 1);
    // Leaves may omit meta entirely.
    assert_eq!(diff.leaves["alice"][0].meta, Value::Null);
}

#[test]
fn heartbeat_round_trip() {
    let probe = round_trip("contracts/ws/v1/examples/heartbeat.json");
    assert_eq!(probe.topic, SYSTEM_TOPIC);
    assert_eq!(probe.event_kind(), Some(EventKind::Heartbeat));

    let reply = round_trip("contracts/ws/v1/examples/heartbeat_reply.json");
    assert_eq!(reply.topic, SYSTEM_TOPIC);
    assert_eq!(reply.seq, probe.seq);
}

#[test]
fn access_token_round_trip() {
    let frame = round_trip("contracts/ws/v1/examples/access_token.json");
    assert_eq!(frame.event_kind(), Some(EventKind::AccessToken));
    assert!(frame.payload["access_token"].as_str().is_some());
}

#[test]
fn rate_limited_reply_carries_retry_after() {
    let frame = round_trip("contracts/ws/v1/examples/rate_limited_reply.json");
    let reply: ReplyPayload = serde_json::from_value(frame.payload).unwrap();
    let detail = reply.error_response().expect("error detail");
    assert_eq!(detail.code.as_deref(), Some(error_codes::MESSAGE_RATE_LIMITED));
    assert_eq!(detail.retry_after, Some(750));
}
