use rb_fabric::{FabricBackend, RedisFabric};
use server::auth::AuthVerifier;
use server::{AppState, ServerConfig};
use std::env;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = ServerConfig::from_env().expect("invalid configuration");

    let verifier = config.auth.as_ref().map(|auth| {
        AuthVerifier::new(
            &auth.secret,
            auth.issuer.as_deref(),
            auth.audience.as_deref(),
        )
    });
    if verifier.is_some() {
        info!("join authentication enabled");
    }

    let state = match &config.fabric_url {
        Some(url) => {
            let fabric = RedisFabric::connect(url)
                .await
                .expect("failed to connect to fabric");
            fabric
                .health_check()
                .await
                .expect("fabric did not answer the health probe");
            info!(backend = fabric.backend_name(), "fabric relay enabled");
            AppState::with_fabric(verifier, Arc::new(fabric))
        }
        None => AppState::new(verifier),
    };
    info!(instance_id = %state.instance_id, "instance id assigned");

    let router = server::build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %config.bind_addr, "server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
    info!("server shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
