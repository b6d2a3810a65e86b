//! Health check endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::server::state::AppState;

pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "active_sessions": state.chat.registry.session_count().await,
        "active_rooms": state.chat.registry.active_room_count().await,
        "waiting_sessions": state.chat.matchmaker.len().await,
    });
    (StatusCode::OK, axum::Json(body))
}
