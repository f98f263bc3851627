pub mod auth;
pub mod channels;
pub mod config;
pub mod fabric_relay;
pub mod http;
pub mod presence;
pub mod router;
pub mod state;
pub mod wire;
pub mod ws;

pub use config::ServerConfig;
pub use state::AppState;

use axum::{
    Router,
    routing::{get, post},
};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/api/broadcast", post(http::broadcast))
        .route("/api/channels/{topic}", get(http::channel_info))
        .route("/health", get(http::health))
        .with_state(state)
}
