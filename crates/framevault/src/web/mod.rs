//! Web server module: axum HTTP + WebSocket ingestion surface.
//!
//! - `GET /health`: liveness
//! - `GET /api/status`: gateway stats and uptime
//! - `WS /api/rooms/{id}/ws`: producer connection for one room
//! - `GET /api/rooms/{id}/recordings`: recording records of a room
//! - `GET /api/rooms/{id}/analytics`: aggregated room analytics and quota

pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::gateway::SessionGateway;
use crate::room::RoomId;

/// Shared state for the web server
struct WebState {
    gateway: SessionGateway,
    start_time: Instant,
    shutdown: CancellationToken,
    /// Producer connections, so shutdown can wait for their finalization
    connections: TaskTracker,
}

/// Build the HTTP router.
///
/// Producer connections end when `shutdown` fires; each one finalizes its
/// recording first. `connections` tracks them so the caller can wait.
pub fn router(
    gateway: SessionGateway,
    shutdown: CancellationToken,
    connections: TaskTracker,
) -> Router {
    let state = Arc::new(WebState {
        gateway,
        start_time: Instant::now(),
        shutdown,
        connections,
    });

    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(api_status))
        .route("/api/rooms/{id}/ws", get(ws_upgrade))
        .route("/api/rooms/{id}/recordings", get(api_recordings))
        .route("/api/rooms/{id}/analytics", get(api_analytics))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the web server and serve until `shutdown` fires.
pub async fn start(
    gateway: SessionGateway,
    bind: SocketAddr,
    shutdown: CancellationToken,
    connections: TaskTracker,
) -> Result<()> {
    let app = router(gateway, shutdown.clone(), connections);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .context(format!("Failed to bind to {}", bind))?;

    info!("Web server listening on http://{}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Web server error")?;

    Ok(())
}

fn refusal_status(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::UnknownRoom(_) => StatusCode::NOT_FOUND,
        GatewayError::RoomBusy(_) => StatusCode::CONFLICT,
        GatewayError::Directory(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// WebSocket upgrade handler. The room lease is taken before upgrading so
/// refusals surface as plain HTTP errors.
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<Arc<WebState>>,
) -> Response {
    let session = match state.gateway.open(&RoomId::new(id)).await {
        Ok(session) => session,
        Err(e) => return (refusal_status(&e), e.to_string()).into_response(),
    };

    let tick = state.gateway.config().tick_interval;
    let shutdown = state.shutdown.clone();
    let connections = state.connections.clone();
    ws.on_upgrade(move |socket| {
        connections.track_future(ws::handle_ws(socket, session, tick, shutdown))
    })
}

async fn health() -> &'static str {
    "OK"
}

/// GET /api/status
async fn api_status(State(state): State<Arc<WebState>>) -> Json<serde_json::Value> {
    let stats = state.gateway.stats();
    let uptime = state.start_time.elapsed().as_secs();

    Json(serde_json::json!({
        "uptime_secs": uptime,
        "stats": stats,
    }))
}

/// GET /api/rooms/{id}/recordings
async fn api_recordings(
    Path(id): Path<String>,
    State(state): State<Arc<WebState>>,
) -> Json<serde_json::Value> {
    let records = state.gateway.recordings().for_room(&RoomId::new(id)).await;
    Json(serde_json::json!(records))
}

/// GET /api/rooms/{id}/analytics
async fn api_analytics(
    Path(id): Path<String>,
    State(state): State<Arc<WebState>>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let room_id = RoomId::new(id);
    let room = state
        .gateway
        .directory()
        .room(&room_id)
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                format!("room {} does not exist", room_id),
            )
        })?;

    let analytics = state.gateway.recordings().analytics(&room_id).await;
    let quota = match state.gateway.quota().usage(&room.account).await {
        Ok(usage) => usage,
        Err(e) => {
            warn!(room = %room_id, error = %e, "Quota lookup failed");
            None
        }
    };

    Ok(Json(serde_json::json!({
        "room": room_id,
        "account": room.account,
        "analytics": analytics,
        "quota": quota.map(|q| serde_json::json!({
            "limit": q.limit,
            "used": q.used,
            "percentage": q.percentage(),
        })),
        "connected": state.gateway.is_room_busy(&room_id),
    })))
}
