//! WebSocket upgrade and connection admission.
//!
//! Admission order: ban gate (failing closed on a broken lookup), then the
//! connection rate limit, then session registration.  A refused connection
//! gets exactly one frame saying why before the socket is dropped.

use std::net::SocketAddr;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;

use crate::clock;
use crate::dlog;
use crate::logging;
use crate::protocol::{self, ServerEvent};
use crate::ratelimit::CONNECTION_RULE;
use crate::router;
use crate::server::state::AppState;
use crate::server::utils::source_addr;

const MSG_CONNECTION_LIMIT: &str = "Too many connections. Please wait a moment.";

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    let source = source_addr(&headers, Some(addr));
    ws.on_upgrade(move |socket| admit(state, socket, source))
}

async fn refuse(mut socket: WebSocket, event: ServerEvent) {
    let _ = socket
        .send(WsMessage::Text(protocol::encode(&event)))
        .await;
}

async fn admit(state: AppState, socket: WebSocket, source: String) {
    match state.bans.is_banned(&source).await {
        Ok(false) => {}
        Ok(true) => {
            dlog!("admit: refused banned source {}", logging::source(&source));
            refuse(socket, ServerEvent::Banned {}).await;
            return;
        }
        Err(e) => {
            dlog!(
                "admit: ban lookup failed for {}: {e}",
                logging::source(&source)
            );
            refuse(
                socket,
                ServerEvent::Error {
                    message: "service unavailable".to_string(),
                },
            )
            .await;
            return;
        }
    }

    if !state.chat.limiter.check(&source, &CONNECTION_RULE).await {
        dlog!(
            "admit: connection rate exceeded for {}",
            logging::source(&source)
        );
        refuse(
            socket,
            ServerEvent::RateLimited {
                message: MSG_CONNECTION_LIMIT.to_string(),
            },
        )
        .await;
        return;
    }
    state
        .chat
        .limiter
        .increment(&source, &CONNECTION_RULE)
        .await;

    let (session_id, rx) = state
        .chat
        .registry
        .register(&source, clock::now_secs())
        .await;
    dlog!(
        "session {} connected from {}",
        logging::session_id(&session_id),
        logging::source(&source)
    );

    router::run_session(state.chat.clone(), socket, session_id.clone(), source, rx).await;

    dlog!("session {} disconnected", logging::session_id(&session_id));
}
