//! FIFO matchmaking over waiting sessions.
//!
//! The queue is the single source of truth for who is waiting; the registry
//! is the single source of truth for whether a waiting entry still refers to
//! a live session.  Matching locks the queue, then the registry, and never
//! the other way around.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::dlog;
use crate::logging;
use crate::protocol::new_id;
use crate::registry::{ConnectionRegistry, PairOutcome, Room};

/// One session waiting to be paired.
#[derive(Debug, Clone)]
pub struct WaitingEntry {
    pub session_id: String,
    pub source: String,
    pub enqueued_at: u64,
}

/// A completed pairing, as reported to the caller of [`Matchmaker::run_matching`].
pub struct Match {
    pub room: Room,
    /// Number of active rooms right after this pairing, for peak tracking.
    pub active_rooms: usize,
}

#[derive(Clone)]
pub struct Matchmaker {
    queue: Arc<Mutex<VecDeque<WaitingEntry>>>,
}

impl Default for Matchmaker {
    fn default() -> Self {
        Self::new()
    }
}

impl Matchmaker {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Append a waiting entry.  Returns false (and leaves the queue alone) if
    /// the session is already queued.
    pub async fn enqueue(&self, entry: WaitingEntry) -> bool {
        let mut queue = self.queue.lock().await;
        if queue.iter().any(|e| e.session_id == entry.session_id) {
            return false;
        }
        queue.push_back(entry);
        true
    }

    /// Remove a session's waiting entry, if present.
    pub async fn remove(&self, session_id: &str) -> bool {
        let mut queue = self.queue.lock().await;
        let before = queue.len();
        queue.retain(|e| e.session_id != session_id);
        queue.len() != before
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    /// Waiting entries in enqueue order (oldest first).
    pub async fn snapshot(&self) -> Vec<WaitingEntry> {
        self.queue.lock().await.iter().cloned().collect()
    }

    /// Pair waiting sessions while at least two are queued.
    ///
    /// The two oldest entries are popped and resolved against the registry.
    /// An entry whose session died or stopped waiting is discarded and the
    /// survivor goes back to the *front*, preserving its place in line.
    /// Pairing itself (state flips, cross-links, room creation, the
    /// `partner_found` frames) happens inside the registry's critical
    /// section.
    pub async fn run_matching(&self, registry: &ConnectionRegistry, now: u64) -> Vec<Match> {
        let mut queue = self.queue.lock().await;
        let mut matches = Vec::new();

        while queue.len() >= 2 {
            let first = queue.pop_front().expect("len checked");
            let second = queue.pop_front().expect("len checked");

            let room_id = new_id();
            match registry
                .pair(&first.session_id, &second.session_id, &room_id, now)
                .await
            {
                PairOutcome::Paired { room, active_rooms } => {
                    dlog!(
                        "match: paired {} with {} in {}",
                        logging::session_id(&first.session_id),
                        logging::session_id(&second.session_id),
                        logging::room_id(&room_id)
                    );
                    matches.push(Match { room, active_rooms });
                }
                PairOutcome::Stale {
                    first_live,
                    second_live,
                } => {
                    // Requeue survivors at the front, oldest outermost
                    if second_live {
                        queue.push_front(second);
                    }
                    if first_live {
                        queue.push_front(first);
                    }
                    // Both candidates live would have paired; at least one
                    // entry was dropped, so the loop still terminates.
                    if first_live && second_live {
                        break;
                    }
                }
            }
        }

        matches
    }
}
