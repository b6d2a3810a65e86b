//! Per-session frame routing: drives the client state machine and fans
//! traffic to the partner through the registry.
//!
//! One task per connection owns both halves of the socket: inbound frames
//! are processed strictly in order, and outbound frames drain from the
//! session's bounded queue, so each side sees the other's messages in send
//! order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use tokio::sync::{mpsc, Mutex};

use crate::clock;
use crate::counters::{self, Counters};
use crate::dlog;
use crate::logging;
use crate::matchmaker::{Matchmaker, WaitingEntry};
use crate::moderation::{self, Severity};
use crate::protocol::{self, ChatMessage, ClientEvent, MediaKind, ServerEvent};
use crate::ratelimit::{RateLimiter, MESSAGE_RULE};
use crate::registry::{ConnectionRegistry, Room, SessionState};
use crate::storage::Storage;

/// Minimum spacing between forwarded `partner_typing` frames.
pub const TYPING_COALESCE: Duration = Duration::from_secs(2);

const ERR_NO_PARTNER: &str = "Not connected to a partner";
const ERR_INVALID_MESSAGE: &str = "Invalid message";
const ERR_INVALID_MEDIA: &str = "Invalid media";
const MSG_RATE_LIMITED: &str = "You're sending messages too quickly. Please slow down.";
const MSG_FLAGGED_SPAM: &str = "Message not sent: flagged as spam.";
const MSG_FLAGGED_BLOCKED: &str = "Message not sent: blocked by the content filter.";

/// Shared handles every session task needs.
#[derive(Clone)]
pub struct ChatContext {
    pub registry: ConnectionRegistry,
    pub matchmaker: Matchmaker,
    pub limiter: RateLimiter,
    pub counters: Counters,
    pub storage: Arc<Mutex<Storage>>,
}

/// Run one admitted connection to completion.  The caller has already passed
/// the ban and connection-rate gates and registered the session.
pub async fn run_session(
    ctx: ChatContext,
    mut socket: WebSocket,
    session_id: String,
    source: String,
    mut rx: mpsc::Receiver<ServerEvent>,
) {
    let mut last_typing_forward: Option<Instant> = None;

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(event) => {
                        let text = protocol::encode(&event);
                        if socket.send(WsMessage::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    // Registry dropped the session (overflow or teardown)
                    None => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        match protocol::parse_client_frame(&text) {
                            Ok(event) => {
                                dispatch(&ctx, &session_id, &source, event, &mut last_typing_forward)
                                    .await;
                            }
                            Err(e) => {
                                dlog!(
                                    "session {}: ignoring frame: {e}",
                                    logging::session_id(&session_id)
                                );
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if socket.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    teardown(&ctx, &session_id).await;
}

async fn dispatch(
    ctx: &ChatContext,
    session_id: &str,
    source: &str,
    event: ClientEvent,
    last_typing: &mut Option<Instant>,
) {
    match event {
        ClientEvent::JoinQueue => join_queue(ctx, session_id, source).await,
        ClientEvent::LeaveQueue => leave_queue(ctx, session_id).await,
        ClientEvent::SendMessage { content } => {
            send_message(ctx, session_id, source, content).await;
        }
        ClientEvent::SendMedia {
            url,
            kind,
            name,
            size,
        } => send_media(ctx, session_id, source, url, kind, name, size).await,
        ClientEvent::Typing => typing(ctx, session_id, last_typing).await,
        ClientEvent::StopTyping => stop_typing(ctx, session_id, last_typing).await,
        ClientEvent::DisconnectChat => disconnect_chat(ctx, session_id).await,
    }
}

async fn send_error(ctx: &ChatContext, session_id: &str, message: &str) {
    ctx.registry
        .send(
            session_id,
            ServerEvent::Error {
                message: message.to_string(),
            },
        )
        .await;
}

// ---------------------------------------------------------------------------
// Queue membership
// ---------------------------------------------------------------------------

async fn join_queue(ctx: &ChatContext, session_id: &str, source: &str) {
    match ctx.registry.mark_waiting(session_id).await {
        Ok(()) => {}
        Err(SessionState::Waiting) => {
            send_error(ctx, session_id, "Already waiting for a partner").await;
            return;
        }
        Err(SessionState::Paired) => {
            send_error(ctx, session_id, "Already in a chat").await;
            return;
        }
        Err(_) => return,
    }

    ctx.matchmaker
        .enqueue(WaitingEntry {
            session_id: session_id.to_string(),
            source: source.to_string(),
            enqueued_at: clock::now_secs(),
        })
        .await;
    ctx.registry
        .send(session_id, ServerEvent::QueueJoined {})
        .await;

    run_matching(ctx).await;
}

async fn leave_queue(ctx: &ChatContext, session_id: &str) {
    match ctx.registry.mark_idle(session_id).await {
        Ok(()) => {
            ctx.matchmaker.remove(session_id).await;
        }
        Err(_) => send_error(ctx, session_id, "Not waiting in queue").await,
    }
}

/// Drain the waiting queue, then do the bookkeeping for any pairings made:
/// today's unique sources, the room peak, and the session log row.
async fn run_matching(ctx: &ChatContext) {
    let now = clock::now_secs();
    let matches = ctx.matchmaker.run_matching(&ctx.registry, now).await;
    for m in matches {
        if let Some(snapshot) = ctx
            .counters
            .note_pairing(&m.room.sources.0, &m.room.sources.1, m.active_rooms, now)
            .await
        {
            counters::persist_day(&ctx.storage, snapshot).await;
        }

        let storage = ctx.storage.lock().await;
        if let Err(e) = storage.insert_session_log(
            &m.room.room_id,
            &m.room.sources.0,
            &m.room.sources.1,
            m.room.started_at,
        ) {
            dlog!(
                "failed to log session start for {}: {e}",
                logging::room_id(&m.room.room_id)
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Message pipeline
// ---------------------------------------------------------------------------

async fn send_message(ctx: &ChatContext, session_id: &str, source: &str, content: String) {
    // 1. Only paired sessions talk
    let Some((partner_id, room_id)) = ctx.registry.partner_of(session_id).await else {
        send_error(ctx, session_id, ERR_NO_PARTNER).await;
        return;
    };

    // 2. Rate limit: refusal relays nothing and logs nothing
    if !ctx.limiter.check(source, &MESSAGE_RULE).await {
        ctx.registry
            .send(
                session_id,
                ServerEvent::RateLimited {
                    message: MSG_RATE_LIMITED.to_string(),
                },
            )
            .await;
        return;
    }

    // 3-4. Sanitize, then validate what survived
    let content = moderation::sanitize(&content);
    if content.is_empty() || content.chars().count() > moderation::MAX_MESSAGE_CHARS {
        send_error(ctx, session_id, ERR_INVALID_MESSAGE).await;
        return;
    }

    let now = clock::now_secs();

    // 5. Spam
    if moderation::is_spam(&content) {
        ctx.registry
            .send(
                session_id,
                ServerEvent::MessageFlagged {
                    message: MSG_FLAGGED_SPAM.to_string(),
                },
            )
            .await;
        log_message(ctx, &room_id, source, &content, now, true, Some("spam")).await;
        return;
    }

    // 6. Profanity
    let verdict = moderation::check(&content);
    let content = match verdict.severity {
        Severity::Blocked => {
            ctx.registry
                .send(
                    session_id,
                    ServerEvent::MessageFlagged {
                        message: MSG_FLAGGED_BLOCKED.to_string(),
                    },
                )
                .await;
            log_message(ctx, &room_id, source, &content, now, true, Some("profanity")).await;
            return;
        }
        Severity::Warning => moderation::mask(&content),
        Severity::Clean => content,
    };

    // 7. Relay
    let message = ChatMessage::text(session_id, content.clone(), clock::now_millis());
    ctx.registry
        .send(&partner_id, ServerEvent::MessageReceived { message })
        .await;

    // 8. Counters and the log
    ctx.registry.bump_room_message(&room_id, now).await;
    if let Some(snapshot) = ctx.counters.note_message(now).await {
        counters::persist_day(&ctx.storage, snapshot).await;
    }
    ctx.limiter.increment(source, &MESSAGE_RULE).await;
    log_message(ctx, &room_id, source, &content, now, false, None).await;
}

#[allow(clippy::too_many_arguments)]
async fn send_media(
    ctx: &ChatContext,
    session_id: &str,
    source: &str,
    url: String,
    kind: String,
    name: Option<String>,
    size: Option<u64>,
) {
    let Some((partner_id, room_id)) = ctx.registry.partner_of(session_id).await else {
        send_error(ctx, session_id, ERR_NO_PARTNER).await;
        return;
    };
    let Some(kind) = MediaKind::from_wire(&kind) else {
        send_error(ctx, session_id, ERR_INVALID_MEDIA).await;
        return;
    };

    let message = ChatMessage::media(
        session_id,
        url.clone(),
        kind,
        name,
        size,
        clock::now_millis(),
    );
    ctx.registry
        .send(&partner_id, ServerEvent::MediaReceived { message })
        .await;

    // Media skips the rate limiter but still counts against the room
    let now = clock::now_secs();
    ctx.registry.bump_room_message(&room_id, now).await;
    log_message(ctx, &room_id, source, &url, now, false, None).await;
}

async fn log_message(
    ctx: &ChatContext,
    room_id: &str,
    sender_ip: &str,
    content: &str,
    now: u64,
    flagged: bool,
    reason: Option<&str>,
) {
    let storage = ctx.storage.lock().await;
    if let Err(e) = storage.append_message(room_id, sender_ip, content, now, flagged, reason) {
        dlog!(
            "failed to log message in {}: {e}",
            logging::room_id(room_id)
        );
    }
}

// ---------------------------------------------------------------------------
// Typing indicators
// ---------------------------------------------------------------------------

async fn typing(ctx: &ChatContext, session_id: &str, last: &mut Option<Instant>) {
    let Some((partner_id, _)) = ctx.registry.partner_of(session_id).await else {
        send_error(ctx, session_id, ERR_NO_PARTNER).await;
        return;
    };
    if last.is_some_and(|t| t.elapsed() < TYPING_COALESCE) {
        return;
    }
    *last = Some(Instant::now());
    ctx.registry
        .send(&partner_id, ServerEvent::PartnerTyping {})
        .await;
}

async fn stop_typing(ctx: &ChatContext, session_id: &str, last: &mut Option<Instant>) {
    let Some((partner_id, _)) = ctx.registry.partner_of(session_id).await else {
        send_error(ctx, session_id, ERR_NO_PARTNER).await;
        return;
    };
    *last = None;
    ctx.registry
        .send(&partner_id, ServerEvent::PartnerStoppedTyping {})
        .await;
}

// ---------------------------------------------------------------------------
// Disconnects
// ---------------------------------------------------------------------------

async fn disconnect_chat(ctx: &ChatContext, session_id: &str) {
    match ctx.registry.leave_chat(session_id).await {
        Some(room) => close_room_log(ctx, &room).await,
        None => send_error(ctx, session_id, ERR_NO_PARTNER).await,
    }
}

/// Mark an ended room in the session log, swallowing storage failures.
pub async fn close_room_log(ctx: &ChatContext, room: &Room) {
    let now = clock::now_secs();
    let storage = ctx.storage.lock().await;
    if let Err(e) = storage.close_session_log(&room.room_id, now, room.message_count) {
        dlog!(
            "failed to log session end for {}: {e}",
            logging::room_id(&room.room_id)
        );
    }
}

/// Finalizer for a closing connection.  Safe to run more than once; the
/// second run finds nothing to do.
pub async fn teardown(ctx: &ChatContext, session_id: &str) {
    ctx.matchmaker.remove(session_id).await;
    if let Some(room) = ctx.registry.unregister(session_id).await {
        close_room_log(ctx, &room).await;
    }
}
