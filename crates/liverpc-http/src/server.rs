//! HTTP server implementation using Axum.

use crate::handler::{handle_health, handle_rpc, handle_subscribe};
use axum::{
    routing::{get, post},
    Router,
};
use liverpc::config::HttpConfig;
use liverpc::Dispatch;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Application state shared across handlers.
pub struct AppState {
    /// Where calls and subscriptions are dispatched, usually a `Registry`.
    pub dispatch: Arc<dyn Dispatch>,
}

/// Routes of the adapter, without binding a listener.
pub fn router<D: Dispatch>(dispatch: Arc<D>) -> Router {
    let state = Arc::new(AppState { dispatch });

    // Configure CORS for browser clients
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/rpc", post(handle_rpc))
        .route("/subscribe/:name", get(handle_subscribe))
        .layer(GlobalConcurrencyLimitLayer::new(
            HttpConfig::MAX_CONCURRENT_REQUESTS,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_server<D: Dispatch>(
    dispatch: Arc<D>,
    host: &str,
    port: u16,
) -> anyhow::Result<SocketAddr> {
    let app = router(dispatch);

    // Parse the address
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;

    // Bind to the address
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Server listening on {}", actual_addr);

    // Spawn the server in the background
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Server error: {}", e);
        }
    });

    Ok(actual_addr)
}
