//! Admin surface: live stats, rooms, queue, bans, and appeal review.
//!
//! Everything here reads through the registry snapshots or storage; session
//! state is never mutated from this side.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::clock;
use crate::dlog;
use crate::server::state::AppState;
use crate::server::utils::api_error;
use crate::storage::AppealRow;

pub async fn stats_handler(State(state): State<AppState>) -> Response {
    let active_rooms = state.chat.registry.active_room_count().await;
    let waiting_sessions = state.chat.matchmaker.len().await;
    let messages_today = state.chat.counters.messages_today().await;
    let total_bans = match state.chat.storage.lock().await.count_bans() {
        Ok(n) => n,
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let body = serde_json::json!({
        "activeRooms": active_rooms,
        "waitingSessions": waiting_sessions,
        "totalBans": total_bans,
        "messagesToday": messages_today,
    });
    (StatusCode::OK, axum::Json(body)).into_response()
}

pub async fn chats_handler(State(state): State<AppState>) -> Response {
    let rooms = state.chat.registry.snapshot_rooms().await;
    let json: Vec<serde_json::Value> = rooms
        .iter()
        .map(|r| {
            serde_json::json!({
                "roomId": r.room_id,
                "sessionIds": [r.sessions.0, r.sessions.1],
                "ips": [r.sources.0, r.sources.1],
                "startedAt": r.started_at,
                "messageCount": r.message_count,
                "lastActivity": r.last_activity,
            })
        })
        .collect();
    (StatusCode::OK, axum::Json(serde_json::json!(json))).into_response()
}

pub async fn queue_handler(State(state): State<AppState>) -> Response {
    let waiting = state.chat.matchmaker.snapshot().await;
    let json: Vec<serde_json::Value> = waiting
        .iter()
        .map(|e| {
            serde_json::json!({
                "sessionId": e.session_id,
                "ip": e.source,
                "enqueuedAt": e.enqueued_at,
            })
        })
        .collect();
    (StatusCode::OK, axum::Json(serde_json::json!(json))).into_response()
}

// -- Bans --

pub async fn list_bans_handler(State(state): State<AppState>) -> Response {
    let storage = state.chat.storage.lock().await;
    match storage.list_bans() {
        Ok(bans) => (StatusCode::OK, axum::Json(serde_json::json!(bans))).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Deserialize)]
pub struct CreateBanRequest {
    ip: String,
    #[serde(default)]
    reason: String,
}

pub async fn create_ban_handler(
    State(state): State<AppState>,
    axum::Json(req): axum::Json<CreateBanRequest>,
) -> Response {
    let ip = req.ip.trim();
    if ip.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "IP address is required");
    }

    let now = clock::now_secs();
    let created = {
        let storage = state.chat.storage.lock().await;
        match storage.is_banned(ip) {
            Ok(true) => return api_error(StatusCode::CONFLICT, "IP is already banned"),
            Ok(false) => {}
            Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
        match storage.insert_ban(ip, &req.reason, "admin", now) {
            Ok(id) => id,
            Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    };
    state.bans.invalidate();
    dlog!("admin: banned {}", ip);

    let body = serde_json::json!({
        "id": created,
        "ip_address": ip,
        "reason": req.reason,
        "banned_at": now,
        "banned_by": "admin",
    });
    (StatusCode::CREATED, axum::Json(body)).into_response()
}

pub async fn delete_ban_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Response {
    let deleted = {
        let storage = state.chat.storage.lock().await;
        match storage.delete_ban(id) {
            Ok(deleted) => deleted,
            Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    };
    if !deleted {
        return api_error(StatusCode::NOT_FOUND, "ban not found");
    }
    state.bans.invalidate();
    dlog!("admin: removed ban {id}");
    (StatusCode::OK, axum::Json(serde_json::json!({ "ok": true }))).into_response()
}

// -- Appeals --

#[derive(Deserialize)]
pub struct AppealsQuery {
    status: Option<String>,
}

pub async fn list_appeals_handler(
    State(state): State<AppState>,
    Query(params): Query<AppealsQuery>,
) -> Response {
    let storage = state.chat.storage.lock().await;
    match storage.list_appeals(params.status.as_deref()) {
        Ok(appeals) => (StatusCode::OK, axum::Json(serde_json::json!(appeals))).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Deserialize)]
pub struct ResolveAppealRequest {
    status: String,
    notes: Option<String>,
}

pub async fn resolve_appeal_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    axum::Json(req): axum::Json<ResolveAppealRequest>,
) -> Response {
    if req.status != "approved" && req.status != "rejected" {
        return api_error(
            StatusCode::BAD_REQUEST,
            "status must be approved or rejected",
        );
    }

    let now = clock::now_secs();
    let resolved: AppealRow = {
        let storage = state.chat.storage.lock().await;
        let appeal = match storage.get_appeal(id) {
            Ok(Some(appeal)) => appeal,
            Ok(None) => return api_error(StatusCode::NOT_FOUND, "appeal not found"),
            Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        if appeal.status != "pending" {
            return api_error(StatusCode::CONFLICT, "appeal already resolved");
        }

        if let Err(e) =
            storage.resolve_appeal(id, &req.status, "admin", req.notes.as_deref(), now)
        {
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }

        // Approval lifts the ban
        if req.status == "approved" {
            if let Err(e) = storage.delete_ban_by_ip(&appeal.ip_address) {
                dlog!("admin: failed to lift ban for {}: {e}", appeal.ip_address);
            }
        }

        match storage.get_appeal(id) {
            Ok(Some(appeal)) => appeal,
            Ok(None) => return api_error(StatusCode::NOT_FOUND, "appeal not found"),
            Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    };
    if req.status == "approved" {
        state.bans.invalidate();
    }
    dlog!("admin: appeal {id} {}", req.status);

    (StatusCode::OK, axum::Json(serde_json::json!(resolved))).into_response()
}
