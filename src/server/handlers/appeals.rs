//! End-user endpoints: ban appeals and the self ban check.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::clock;
use crate::dlog;
use crate::server::state::AppState;
use crate::server::utils::{api_error, source_addr};

#[derive(Deserialize)]
pub struct SubmitAppealRequest {
    ip: String,
    email: String,
    reason: String,
}

pub async fn submit_appeal_handler(
    State(state): State<AppState>,
    axum::Json(req): axum::Json<SubmitAppealRequest>,
) -> Response {
    let ip = req.ip.trim();
    let email = req.email.trim();
    let reason = req.reason.trim();
    if ip.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "IP address is required");
    }
    if email.is_empty() || !email.contains('@') {
        return api_error(StatusCode::BAD_REQUEST, "A valid contact email is required");
    }
    if reason.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "A reason is required");
    }

    let storage = state.chat.storage.lock().await;
    match storage.is_banned(ip) {
        Ok(true) => {}
        Ok(false) => return api_error(StatusCode::CONFLICT, "No active ban for this IP"),
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
    match storage.has_pending_appeal(ip) {
        Ok(false) => {}
        Ok(true) => {
            return api_error(
                StatusCode::CONFLICT,
                "An appeal is already pending for this IP",
            )
        }
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }

    let id = match storage.insert_appeal(ip, email, reason, clock::now_secs()) {
        Ok(id) => id,
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    dlog!("appeal {id} submitted for {ip}");

    let body = serde_json::json!({ "id": id, "status": "pending" });
    (StatusCode::CREATED, axum::Json(body)).into_response()
}

pub async fn check_ban_handler(
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    let source = source_addr(&headers, Some(addr));
    match state.bans.is_banned(&source).await {
        Ok(banned) => {
            let body = serde_json::json!({ "banned": banned, "ip": source });
            (StatusCode::OK, axum::Json(body)).into_response()
        }
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
