//! The connection registry: authoritative in-memory state of live sessions
//! and rooms.
//!
//! All session and room mutations happen under one mutex; critical sections
//! cover map updates only, never I/O.  Outbound frames are enqueued onto a
//! bounded per-session channel whose receiver side is owned by the session's
//! socket task, so delivery order per session matches enqueue order.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::dlog;
use crate::logging;
use crate::protocol::{new_id, ServerEvent};

/// Outbound frames buffered per session before the connection is considered
/// unhealthy and torn down.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Lifecycle of one connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Waiting,
    Paired,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Waiting => "waiting",
            SessionState::Paired => "paired",
            SessionState::Closed => "closed",
        }
    }
}

struct Session {
    source: String,
    state: SessionState,
    partner_id: Option<String>,
    room_id: Option<String>,
    connected_at: u64,
    outbound: mpsc::Sender<ServerEvent>,
}

/// Read-only view of one session for the admin surface.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub source: String,
    pub state: SessionState,
    pub room_id: Option<String>,
    pub connected_at: u64,
}

/// A live pairing of two sessions.
#[derive(Debug, Clone)]
pub struct Room {
    pub room_id: String,
    pub sessions: (String, String),
    pub sources: (String, String),
    pub started_at: u64,
    pub message_count: u64,
    pub last_activity: u64,
}

/// Result of a pairing attempt on two queue candidates.
pub enum PairOutcome {
    Paired { room: Room, active_rooms: usize },
    /// At least one candidate was gone or no longer waiting; the flags say
    /// which of the two is still a live waiting session.
    Stale { first_live: bool, second_live: bool },
}

struct RegistryInner {
    sessions: HashMap<String, Session>,
    rooms: HashMap<String, Room>,
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                sessions: HashMap::new(),
                rooms: HashMap::new(),
            })),
        }
    }

    /// Allocate a session for an admitted connection.  Returns the session id
    /// and the receiver half of its outbound queue; the caller's socket task
    /// owns the receiver for the life of the connection.
    pub async fn register(&self, source: &str, now: u64) -> (String, mpsc::Receiver<ServerEvent>) {
        let session_id = new_id();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let mut inner = self.inner.lock().await;
        inner.sessions.insert(
            session_id.clone(),
            Session {
                source: source.to_string(),
                state: SessionState::Idle,
                partner_id: None,
                room_id: None,
                connected_at: now,
                outbound: tx,
            },
        );
        (session_id, rx)
    }

    /// Enqueue one frame to a session.  Silently drops if the session is
    /// closed or gone.  A full queue means the client stopped draining; the
    /// session is closed on the spot and its socket task will notice the
    /// channel going away.
    pub async fn send(&self, session_id: &str, event: ServerEvent) {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.sessions.get_mut(session_id) {
            enqueue(session_id, session, event);
        }
    }

    /// Move an Idle session to Waiting.  On refusal, returns the state the
    /// session was actually in.
    pub async fn mark_waiting(&self, session_id: &str) -> Result<(), SessionState> {
        let mut inner = self.inner.lock().await;
        match inner.sessions.get_mut(session_id) {
            Some(session) if session.state == SessionState::Idle => {
                session.state = SessionState::Waiting;
                Ok(())
            }
            Some(session) => Err(session.state),
            None => Err(SessionState::Closed),
        }
    }

    /// Move a Waiting session back to Idle (queue leave).
    pub async fn mark_idle(&self, session_id: &str) -> Result<(), SessionState> {
        let mut inner = self.inner.lock().await;
        match inner.sessions.get_mut(session_id) {
            Some(session) if session.state == SessionState::Waiting => {
                session.state = SessionState::Idle;
                Ok(())
            }
            Some(session) => Err(session.state),
            None => Err(SessionState::Closed),
        }
    }

    pub async fn session_state(&self, session_id: &str) -> Option<SessionState> {
        let inner = self.inner.lock().await;
        inner.sessions.get(session_id).map(|s| s.state)
    }

    /// Partner and room of a Paired session.
    pub async fn partner_of(&self, session_id: &str) -> Option<(String, String)> {
        let inner = self.inner.lock().await;
        let session = inner.sessions.get(session_id)?;
        if session.state != SessionState::Paired {
            return None;
        }
        match (&session.partner_id, &session.room_id) {
            (Some(partner), Some(room)) => Some((partner.clone(), room.clone())),
            _ => None,
        }
    }

    /// Pair two queue candidates under one critical section: both sessions
    /// flip to Paired, cross-link, the room is recorded, and `partner_found`
    /// lands on both outbound queues before the lock is released.
    pub async fn pair(&self, first: &str, second: &str, room_id: &str, now: u64) -> PairOutcome {
        let mut inner = self.inner.lock().await;

        let live = |inner: &RegistryInner, id: &str| {
            inner
                .sessions
                .get(id)
                .is_some_and(|s| s.state == SessionState::Waiting)
        };
        let first_live = live(&inner, first);
        let second_live = live(&inner, second) && first != second;
        if !first_live || !second_live {
            return PairOutcome::Stale {
                first_live,
                second_live,
            };
        }

        let source_a = inner.sessions[first].source.clone();
        let source_b = inner.sessions[second].source.clone();

        {
            let a = inner.sessions.get_mut(first).expect("validated above");
            a.state = SessionState::Paired;
            a.partner_id = Some(second.to_string());
            a.room_id = Some(room_id.to_string());
        }
        {
            let b = inner.sessions.get_mut(second).expect("validated above");
            b.state = SessionState::Paired;
            b.partner_id = Some(first.to_string());
            b.room_id = Some(room_id.to_string());
        }

        let room = Room {
            room_id: room_id.to_string(),
            sessions: (first.to_string(), second.to_string()),
            sources: (source_a, source_b),
            started_at: now,
            message_count: 0,
            last_activity: now,
        };
        inner.rooms.insert(room_id.to_string(), room.clone());
        let active_rooms = inner.rooms.len();

        let found = ServerEvent::PartnerFound {
            room_id: room_id.to_string(),
        };
        for id in [first, second] {
            if let Some(session) = inner.sessions.get_mut(id) {
                enqueue(id, session, found.clone());
            }
        }

        PairOutcome::Paired { room, active_rooms }
    }

    /// Record one relayed message on the room.
    pub async fn bump_room_message(&self, room_id: &str, now: u64) {
        let mut inner = self.inner.lock().await;
        if let Some(room) = inner.rooms.get_mut(room_id) {
            room.message_count += 1;
            room.last_activity = now;
        }
    }

    /// Break the pairing of `session_id`, notifying the partner.  Both sides
    /// revert to Idle; the removed room is returned for the session log.
    /// No-op unless the session is Paired.
    pub async fn leave_chat(&self, session_id: &str) -> Option<Room> {
        let mut inner = self.inner.lock().await;
        unpair(&mut inner, session_id)
    }

    /// Tear a session down completely: sever any pairing (notifying the
    /// partner), then drop the session.  Dropping it closes the outbound
    /// channel, which is what the session's socket task is waiting on.
    /// Idempotent: a second call finds nothing and changes nothing.
    pub async fn unregister(&self, session_id: &str) -> Option<Room> {
        let mut inner = self.inner.lock().await;
        let ended = unpair(&mut inner, session_id);
        inner.sessions.remove(session_id);
        ended
    }

    /// End rooms whose last activity predates `idle_before`.  Both partners
    /// are notified and reverted to Idle; the ended rooms are returned for
    /// the session log.
    pub async fn end_idle_rooms(&self, idle_before: u64) -> Vec<Room> {
        let mut inner = self.inner.lock().await;
        let stale: Vec<String> = inner
            .rooms
            .values()
            .filter(|r| r.last_activity < idle_before)
            .map(|r| r.room_id.clone())
            .collect();

        let mut ended = Vec::new();
        for room_id in stale {
            let Some(room) = inner.rooms.remove(&room_id) else {
                continue;
            };
            for id in [&room.sessions.0, &room.sessions.1] {
                if let Some(session) = inner.sessions.get_mut(id.as_str()) {
                    session.state = SessionState::Idle;
                    session.partner_id = None;
                    session.room_id = None;
                    enqueue(id, session, ServerEvent::PartnerDisconnected {});
                }
            }
            dlog!("room {} closed for inactivity", logging::room_id(&room.room_id));
            ended.push(room);
        }
        ended
    }

    pub async fn snapshot_sessions(&self) -> Vec<SessionSnapshot> {
        let inner = self.inner.lock().await;
        inner
            .sessions
            .iter()
            .filter(|(_, s)| s.state != SessionState::Closed)
            .map(|(id, s)| SessionSnapshot {
                session_id: id.clone(),
                source: s.source.clone(),
                state: s.state,
                room_id: s.room_id.clone(),
                connected_at: s.connected_at,
            })
            .collect()
    }

    /// Active rooms, newest first.
    pub async fn snapshot_rooms(&self) -> Vec<Room> {
        let inner = self.inner.lock().await;
        let mut rooms: Vec<Room> = inner.rooms.values().cloned().collect();
        rooms.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then(a.room_id.cmp(&b.room_id))
        });
        rooms
    }

    pub async fn active_room_count(&self) -> usize {
        self.inner.lock().await.rooms.len()
    }

    pub async fn session_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .sessions
            .values()
            .filter(|s| s.state != SessionState::Closed)
            .count()
    }
}

/// Enqueue a frame onto one session's outbound queue.  A frame that does not
/// fit means the client stopped draining: the session flips to Closed and
/// its channel is dropped so the owning socket task unwinds.
fn enqueue(session_id: &str, session: &mut Session, event: ServerEvent) {
    if session.state == SessionState::Closed {
        return;
    }
    if session.outbound.try_send(event).is_err() {
        dlog!(
            "session {} outbound queue stalled, closing",
            logging::session_id(session_id)
        );
        session.state = SessionState::Closed;
        // Swap in a sender whose receiver is already gone; dropping the real
        // one wakes the socket task with a closed channel.
        session.outbound = mpsc::channel(1).0;
    }
}

/// Shared unpair path for explicit chat leave and full teardown.
fn unpair(inner: &mut RegistryInner, session_id: &str) -> Option<Room> {
    let (partner_id, room_id) = {
        let session = inner.sessions.get(session_id)?;
        if session.state != SessionState::Paired {
            return None;
        }
        (session.partner_id.clone()?, session.room_id.clone()?)
    };

    if let Some(session) = inner.sessions.get_mut(session_id) {
        session.state = SessionState::Idle;
        session.partner_id = None;
        session.room_id = None;
    }
    if let Some(partner) = inner.sessions.get_mut(&partner_id) {
        partner.state = SessionState::Idle;
        partner.partner_id = None;
        partner.room_id = None;
        enqueue(&partner_id, partner, ServerEvent::PartnerDisconnected {});
    }
    inner.rooms.remove(&room_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn two_paired(
        registry: &ConnectionRegistry,
    ) -> (
        String,
        mpsc::Receiver<ServerEvent>,
        String,
        mpsc::Receiver<ServerEvent>,
    ) {
        let (a, rx_a) = registry.register("1.1.1.1", 100).await;
        let (b, rx_b) = registry.register("2.2.2.2", 100).await;
        registry.mark_waiting(&a).await.unwrap();
        registry.mark_waiting(&b).await.unwrap();
        match registry.pair(&a, &b, "room-1", 100).await {
            PairOutcome::Paired { .. } => {}
            PairOutcome::Stale { .. } => panic!("expected pairing"),
        }
        (a, rx_a, b, rx_b)
    }

    #[tokio::test]
    async fn test_pairing_links_both_sides() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a, b, mut rx_b) = two_paired(&registry).await;

        let (partner_of_a, room_a) = registry.partner_of(&a).await.unwrap();
        let (partner_of_b, room_b) = registry.partner_of(&b).await.unwrap();
        assert_eq!(partner_of_a, b);
        assert_eq!(partner_of_b, a);
        assert_eq!(room_a, room_b);

        // Both sides got partner_found first
        assert!(matches!(
            rx_a.recv().await.unwrap(),
            ServerEvent::PartnerFound { .. }
        ));
        assert!(matches!(
            rx_b.recv().await.unwrap(),
            ServerEvent::PartnerFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_pair_rejects_non_waiting() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = registry.register("1.1.1.1", 100).await;
        let (b, _rx_b) = registry.register("2.2.2.2", 100).await;
        registry.mark_waiting(&a).await.unwrap();
        // b never joined the queue
        match registry.pair(&a, &b, "room-1", 100).await {
            PairOutcome::Stale {
                first_live,
                second_live,
            } => {
                assert!(first_live);
                assert!(!second_live);
            }
            PairOutcome::Paired { .. } => panic!("must not pair"),
        }
        // a is untouched
        assert_eq!(
            registry.session_state(&a).await,
            Some(SessionState::Waiting)
        );
    }

    #[tokio::test]
    async fn test_leave_chat_resets_both_and_notifies_partner() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a, b, mut rx_b) = two_paired(&registry).await;
        rx_a.recv().await.unwrap(); // partner_found
        rx_b.recv().await.unwrap();

        let room = registry.leave_chat(&a).await.unwrap();
        assert_eq!(room.room_id, "room-1");
        assert_eq!(registry.session_state(&a).await, Some(SessionState::Idle));
        assert_eq!(registry.session_state(&b).await, Some(SessionState::Idle));
        assert!(registry.partner_of(&a).await.is_none());
        assert_eq!(registry.active_room_count().await, 0);

        // Partner was told; the leaver was not
        assert!(matches!(
            rx_b.recv().await.unwrap(),
            ServerEvent::PartnerDisconnected {}
        ));
        assert!(rx_a.try_recv().is_err());

        // Second leave is a no-op
        assert!(registry.leave_chat(&a).await.is_none());
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a, b, mut rx_b) = two_paired(&registry).await;

        let room = registry.unregister(&a).await;
        assert!(room.is_some());
        assert_eq!(registry.session_count().await, 1);
        assert_eq!(registry.session_state(&b).await, Some(SessionState::Idle));

        // Identical global state after the second call
        assert!(registry.unregister(&a).await.is_none());
        assert_eq!(registry.session_count().await, 1);

        rx_b.recv().await.unwrap(); // partner_found
        assert!(matches!(
            rx_b.recv().await.unwrap(),
            ServerEvent::PartnerDisconnected {}
        ));
    }

    #[tokio::test]
    async fn test_overflow_closes_session() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = registry.register("1.1.1.1", 100).await;

        for _ in 0..=OUTBOUND_QUEUE_CAPACITY {
            registry.send(&a, ServerEvent::PartnerTyping {}).await;
        }
        assert_eq!(
            registry.session_state(&a).await,
            Some(SessionState::Closed)
        );

        // The buffered frames drain, then the channel reports closed
        let mut drained = 0;
        while rx_a.recv().await.is_some() {
            drained += 1;
        }
        assert_eq!(drained, OUTBOUND_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn test_end_idle_rooms() {
        let registry = ConnectionRegistry::new();
        let (_a, mut rx_a, _b, mut rx_b) = two_paired(&registry).await;
        rx_a.recv().await.unwrap();
        rx_b.recv().await.unwrap();

        // Room last_activity is 100; nothing idle before 50
        assert!(registry.end_idle_rooms(50).await.is_empty());

        let ended = registry.end_idle_rooms(500).await;
        assert_eq!(ended.len(), 1);
        assert_eq!(registry.active_room_count().await, 0);
        assert!(matches!(
            rx_a.recv().await.unwrap(),
            ServerEvent::PartnerDisconnected {}
        ));
        assert!(matches!(
            rx_b.recv().await.unwrap(),
            ServerEvent::PartnerDisconnected {}
        ));
    }

    #[tokio::test]
    async fn test_room_message_counter() {
        let registry = ConnectionRegistry::new();
        let (_a, _rx_a, _b, _rx_b) = two_paired(&registry).await;
        registry.bump_room_message("room-1", 150).await;
        registry.bump_room_message("room-1", 160).await;
        let rooms = registry.snapshot_rooms().await;
        assert_eq!(rooms[0].message_count, 2);
        assert_eq!(rooms[0].last_activity, 160);
    }
}
