//! Background maintenance loops, spawned at startup and living for the
//! whole process.

use std::time::Duration;

use crate::clock;
use crate::counters;
use crate::dlog;
use crate::router::{self, ChatContext};
use crate::server::config::{IDLE_ROOM_SECS, IDLE_SWEEP_INTERVAL_SECS, ROLLUP_INTERVAL_SECS};

/// Persist per-hour message deltas (and, across midnight, the finished day's
/// snapshot).
pub async fn rollup_loop(ctx: ChatContext) {
    let mut ticker = tokio::time::interval(Duration::from_secs(ROLLUP_INTERVAL_SECS));
    // The first tick fires immediately and would record an empty hour
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let now = clock::now_secs();
        let active_rooms = ctx.registry.active_room_count().await as u64;
        let (row, rolled) = ctx.counters.hourly_flush(now, active_rooms).await;
        if let Some(snapshot) = rolled {
            counters::persist_day(&ctx.storage, snapshot).await;
        }
        let storage = ctx.storage.lock().await;
        if let Err(e) = storage.upsert_hourly_stats(&row) {
            dlog!("stats: failed to persist hourly row: {e}");
        }
    }
}

/// Close rooms that have seen no traffic for [`IDLE_ROOM_SECS`].
pub async fn idle_sweep_loop(ctx: ChatContext) {
    let mut ticker = tokio::time::interval(Duration::from_secs(IDLE_SWEEP_INTERVAL_SECS));
    loop {
        ticker.tick().await;
        let idle_before = clock::now_secs().saturating_sub(IDLE_ROOM_SECS);
        let ended = ctx.registry.end_idle_rooms(idle_before).await;
        for room in ended {
            router::close_room_log(&ctx, &room).await;
        }
    }
}
