//! Axum-based HTTP and WebSocket server.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use statewire_core::error::SyncError;
use statewire_core::protocol::{ErrorShape, PROTOCOL_VERSION};
use statewire_core::session::SessionId;

use crate::connection::handle_ws_connection;
use crate::state::GatewayState;

/// Build the gateway router.
pub fn router(state: Arc<GatewayState>) -> Router {
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/sessions", get(sessions_handler))
        .route("/sessions/{id}/snapshot", get(snapshot_handler))
        .route("/sessions/{id}/ws", get(ws_handler));

    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(metrics_handler));

    app.layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the gateway on the configured bind address.
pub async fn start_gateway(state: Arc<GatewayState>, port: u16) -> anyhow::Result<()> {
    let addr = format!("{}:{port}", state.config.gateway_bind());
    let listener = TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");
    serve(state, listener).await
}

/// Serve on an already-bound listener until ctrl-c.
pub async fn serve(state: Arc<GatewayState>, listener: TcpListener) -> anyhow::Result<()> {
    let reaper = state.spawn_reaper();
    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;
    reaper.abort();
    served?;
    Ok(())
}

fn error_response(err: &SyncError) -> Response {
    let status = match err {
        SyncError::UnknownSession(_) => StatusCode::NOT_FOUND,
        SyncError::SessionClosed(_) => StatusCode::GONE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorShape::from(err))).into_response()
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let sessions = state.list().await.len();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION,
        "sessions": sessions,
    }))
}

async fn sessions_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(json!({ "sessions": state.list().await }))
}

async fn snapshot_handler(
    Path(id): Path<String>,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    match state.session(&SessionId::from(id)).await {
        Ok(entry) => Json(entry.channel.snapshot()).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    match state.session(&SessionId::from(id)).await {
        Ok(entry) => ws.on_upgrade(move |socket| handle_ws_connection(entry, socket)),
        Err(e) => error_response(&e),
    }
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<Arc<GatewayState>>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(%e, "Failed to install CTRL+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
