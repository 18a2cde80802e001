//! Signaling relay server.
//!
//! Groups connections into call rooms and forwards offer, answer and ICE
//! candidate messages between the members of a room. Payloads are never
//! inspected, and nothing is stored beyond room membership.

pub mod handler;
pub mod state;

use axum::{
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;

pub use state::{RelayConfig, RelayState};

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds `0.0.0.0:<port>` and serves until the process exits.
pub async fn serve(config: RelayConfig) -> std::io::Result<()> {
    let addr = format!("0.0.0.0:{}", config.port);
    let state = RelayState::new(config);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Signaling relay listening on {}", addr);
    axum::serve(listener, router(state)).await
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_websocket(socket, state))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "skillswap-call-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "online_clients": state.online_count(),
        "active_rooms": state.room_count(),
        "max_participants": state.config.max_participants,
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
}
