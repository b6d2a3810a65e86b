//! Axum router construction.

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, patch, post};
use axum::Router;

use crate::server::config::MAX_MEDIA_BYTES;
use crate::server::handlers;
use crate::server::state::AppState;

/// Build the complete Axum router: the WebSocket endpoint, the public API,
/// the media endpoints, and the admin surface.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Realtime chat
        .route("/ws", get(handlers::ws::ws_handler))
        // Public API
        .route("/api/health", get(handlers::health::health_handler))
        .route("/api/check-ban", get(handlers::appeals::check_ban_handler))
        .route("/api/appeals", post(handlers::appeals::submit_appeal_handler))
        // Media
        .route(
            "/api/upload",
            post(handlers::media::upload_media_handler)
                .layer(DefaultBodyLimit::max(MAX_MEDIA_BYTES as usize + 4096)),
        )
        .route("/media/:name", get(handlers::media::serve_media_handler))
        // Admin surface
        .route("/api/admin/stats", get(handlers::admin::stats_handler))
        .route("/api/admin/chats", get(handlers::admin::chats_handler))
        .route("/api/admin/queue", get(handlers::admin::queue_handler))
        .route(
            "/api/admin/bans",
            get(handlers::admin::list_bans_handler).post(handlers::admin::create_ban_handler),
        )
        .route(
            "/api/admin/bans/:id",
            delete(handlers::admin::delete_ban_handler),
        )
        .route(
            "/api/admin/appeals",
            get(handlers::admin::list_appeals_handler),
        )
        .route(
            "/api/admin/appeals/:id",
            patch(handlers::admin::resolve_appeal_handler),
        )
        .with_state(state)
}
