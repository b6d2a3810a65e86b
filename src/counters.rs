//! Live operational counters: messages today, unique sources, peak rooms.
//!
//! Counters reset at the day boundary; the outgoing day's totals are handed
//! back as a snapshot for the caller to persist, so no I/O happens under the
//! counter lock.  The hourly rollup records per-hour message deltas rather
//! than the running day total.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::clock;
use crate::dlog;
use crate::storage::{DailyStatsRow, HourlyStatsRow, Storage};

struct CountersInner {
    /// Day key (days since epoch) the counters currently belong to.
    day: u64,
    today_messages: u64,
    /// Value of `today_messages` at the last hourly flush.
    hour_mark: u64,
    unique_sources: HashSet<String>,
    peak_rooms: u64,
}

impl CountersInner {
    /// If `now` is past the day boundary, return the finished day's snapshot
    /// and reset.
    fn rollover(&mut self, now: u64) -> Option<DailyStatsRow> {
        let today = clock::day_key(now);
        if today == self.day {
            return None;
        }
        let snapshot = DailyStatsRow {
            day: clock::date_string(self.day * 86_400),
            message_count: self.today_messages,
            unique_ips: self.unique_sources.len() as u64,
            peak_rooms: self.peak_rooms,
        };
        self.day = today;
        self.today_messages = 0;
        self.hour_mark = 0;
        self.unique_sources.clear();
        self.peak_rooms = 0;
        Some(snapshot)
    }
}

#[derive(Clone)]
pub struct Counters {
    inner: Arc<Mutex<CountersInner>>,
}

impl Counters {
    pub fn new(now: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CountersInner {
                day: clock::day_key(now),
                today_messages: 0,
                hour_mark: 0,
                unique_sources: HashSet::new(),
                peak_rooms: 0,
            })),
        }
    }

    /// Count one relayed message.  Returns the finished day's snapshot when
    /// `now` crossed the day boundary.
    pub async fn note_message(&self, now: u64) -> Option<DailyStatsRow> {
        let mut inner = self.inner.lock().await;
        let rolled = inner.rollover(now);
        inner.today_messages += 1;
        rolled
    }

    /// Record a fresh pairing: both sources count as seen today and the room
    /// count feeds peak tracking.
    pub async fn note_pairing(
        &self,
        source_a: &str,
        source_b: &str,
        active_rooms: usize,
        now: u64,
    ) -> Option<DailyStatsRow> {
        let mut inner = self.inner.lock().await;
        let rolled = inner.rollover(now);
        inner.unique_sources.insert(source_a.to_string());
        inner.unique_sources.insert(source_b.to_string());
        inner.peak_rooms = inner.peak_rooms.max(active_rooms as u64);
        rolled
    }

    pub async fn messages_today(&self) -> u64 {
        self.inner.lock().await.today_messages
    }

    /// Take the per-hour message delta for the rollup task.  Also performs
    /// the day-boundary check, like every other counter mutation.
    pub async fn hourly_flush(
        &self,
        now: u64,
        active_rooms: u64,
    ) -> (HourlyStatsRow, Option<DailyStatsRow>) {
        let mut inner = self.inner.lock().await;
        let rolled = inner.rollover(now);
        let delta = inner.today_messages - inner.hour_mark;
        inner.hour_mark = inner.today_messages;
        let row = HourlyStatsRow {
            day: clock::date_string(now),
            hour: clock::hour_of_day(now),
            message_count: delta,
            active_rooms,
        };
        (row, rolled)
    }
}

/// Persist a finished day's snapshot, swallowing storage failures.
pub async fn persist_day(storage: &Arc<Mutex<Storage>>, snapshot: DailyStatsRow) {
    dlog!(
        "stats: day {} closed with {} messages, {} sources, peak {} rooms",
        snapshot.day,
        snapshot.message_count,
        snapshot.unique_ips,
        snapshot.peak_rooms
    );
    if let Err(e) = storage.lock().await.upsert_daily_stats(&snapshot) {
        dlog!("stats: failed to persist daily snapshot: {e}");
    }
}
