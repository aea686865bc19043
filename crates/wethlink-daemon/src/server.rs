//! Web server setup and routing

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api;
use crate::state::AppState;
use crate::ws;

/// Console API routes
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(api::get_status))
        .route("/api/context", get(api::get_context))
        .route("/api/snapshot", get(api::get_snapshot))
        .route("/api/endpoints", get(api::list_endpoints))
        .route("/api/endpoints/select", post(api::select_endpoint))
        .route("/api/discovery/scan", post(api::trigger_scan))
        .route(
            "/api/devices/{device}/attrs/{attr}",
            get(api::get_attr).put(api::put_attr),
        )
        .route(
            "/api/devices/{device}/channels/{channel}/attrs/{attr}",
            get(api::get_channel_attr).put(api::put_channel_attr),
        )
        .route(
            "/api/devices/{device}/vco",
            get(api::get_vco).put(api::put_vco),
        )
        .route(
            "/api/devices/{device}/registers",
            get(api::export_registers).post(api::import_registers),
        )
        .route(
            "/api/devices/{device}/registers/{addr}",
            get(api::get_register).put(api::put_register),
        )
        .route("/api/diagnostics", get(api::get_diagnostics))
        .route("/api/heartbeats", get(api::get_heartbeats))
        .route("/api/config", get(api::get_config))
        // WebSocket for real-time updates
        .route("/ws", get(ws::websocket_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Start the heartbeats and serve until `shutdown` fires
pub async fn run(state: Arc<AppState>, bind: &str, shutdown: CancellationToken) -> Result<()> {
    state.start_heartbeats()?;

    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(address = %bind, protocol = "HTTP", "Starting console server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    state.heartbeats.shutdown().await;
    if state.context.disconnect() {
        info!("Context released on shutdown");
    }
    Ok(())
}
