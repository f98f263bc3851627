//! REST surface: server-originated broadcasts plus channel/health
//! inspection.  Response field names are part of the external contract.

use axum::{
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use axum::Json;
use rb_protocol::{API_SENDER, BroadcastPayload, limits};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::state::AppState;
use crate::wire;

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Serialize)]
struct BroadcastOk {
    status: &'static str,
    #[serde(rename = "recipientCount")]
    recipient_count: usize,
}

#[derive(Debug, Serialize)]
struct ApiError {
    status: &'static str,
    reason: String,
}

impl ApiError {
    fn response(status: StatusCode, reason: impl Into<String>) -> Response {
        (
            status,
            Json(ApiError {
                status: "error",
                reason: reason.into(),
            }),
        )
            .into_response()
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// `POST /api/broadcast` — inject a broadcast as the synthetic "api" sender.
/// All local members receive it; the fabric carries it to peer instances.
pub async fn broadcast(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<BroadcastRequest>, JsonRejection>,
) -> Response {
    if let Some(verifier) = &state.auth {
        let Some(token) = extract_bearer(&headers) else {
            return ApiError::response(StatusCode::UNAUTHORIZED, "bearer token required");
        };
        if let Err(failure) = verifier.verify(token) {
            return ApiError::response(StatusCode::UNAUTHORIZED, failure.reason);
        }
    }

    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return ApiError::response(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };
    if request.topic.is_empty() || request.topic.len() > limits::MAX_TOPIC_LEN {
        return ApiError::response(StatusCode::BAD_REQUEST, "invalid topic");
    }
    if request.event.is_empty() || request.event.len() > limits::MAX_EVENT_LEN {
        return ApiError::response(StatusCode::BAD_REQUEST, "invalid event name");
    }

    let message = BroadcastPayload::new(request.event, request.payload);
    let Some(text) = wire::broadcast_text(&request.topic, &message) else {
        return ApiError::response(StatusCode::BAD_REQUEST, "payload not serializable");
    };
    if text.len() > limits::MAX_MESSAGE_BYTES {
        return ApiError::response(StatusCode::BAD_REQUEST, "message exceeds size limit");
    }

    let recipient_count = state.channels.fan_out(&request.topic, &text, None).await;
    if let Some(fabric) = &state.fabric {
        fabric
            .publish_broadcast(&request.topic, &message, API_SENDER)
            .await;
    }
    info!(topic = %request.topic, recipients = recipient_count, "api broadcast");

    Json(BroadcastOk {
        status: "ok",
        recipient_count,
    })
    .into_response()
}

#[derive(Debug, Serialize)]
struct MemberInfo {
    #[serde(rename = "clientId")]
    client_id: String,
}

#[derive(Debug, Serialize)]
pub struct ChannelInfo {
    topic: String,
    #[serde(rename = "memberCount")]
    member_count: usize,
    members: Vec<MemberInfo>,
}

/// `GET /api/channels/{topic}`
pub async fn channel_info(
    State(state): State<AppState>,
    Path(topic): Path<String>,
) -> Json<ChannelInfo> {
    let members: Vec<MemberInfo> = state
        .channels
        .client_ids(&topic)
        .await
        .into_iter()
        .map(|client_id| MemberInfo { client_id })
        .collect();
    Json(ChannelInfo {
        topic,
        member_count: members.len(),
        members,
    })
}

#[derive(Debug, Serialize)]
pub struct Health {
    status: &'static str,
    #[serde(rename = "totalChannels")]
    total_channels: usize,
    #[serde(rename = "totalMembers")]
    total_members: usize,
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<Health> {
    let (total_channels, total_members) = state.channels.totals().await;
    Json(Health {
        status: "healthy",
        total_channels,
        total_members,
    })
}
