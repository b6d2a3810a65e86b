//! Per-source rate limiting over fixed windows.
//!
//! `check` is free of side effects; `increment` is called only after the
//! action was actually performed.  Windows live in the `rate_limits` table so
//! counts survive restarts and stay inspectable.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::clock;
use crate::dlog;
use crate::storage::Storage;

/// A configured action with its limit and window.
#[derive(Debug, Clone, Copy)]
pub struct RateRule {
    pub action: &'static str,
    pub limit: u32,
    pub window_secs: u64,
}

/// New connections per source.
pub const CONNECTION_RULE: RateRule = RateRule {
    action: "connection",
    limit: 5,
    window_secs: 60,
};

/// Text messages per source.
pub const MESSAGE_RULE: RateRule = RateRule {
    action: "message",
    limit: 20,
    window_secs: 60,
};

#[derive(Clone)]
pub struct RateLimiter {
    storage: Arc<Mutex<Storage>>,
}

impl RateLimiter {
    pub fn new(storage: Arc<Mutex<Storage>>) -> Self {
        Self { storage }
    }

    /// Whether `source` may perform the action right now.  Read-only.
    pub async fn check(&self, source: &str, rule: &RateRule) -> bool {
        self.check_at(source, rule, clock::now_secs()).await
    }

    pub(crate) async fn check_at(&self, source: &str, rule: &RateRule, now: u64) -> bool {
        let storage = self.storage.lock().await;
        match storage.get_rate_window(source, rule.action) {
            Ok(Some(w)) if w.window_start + rule.window_secs > now => w.count < rule.limit,
            Ok(_) => true,
            Err(e) => {
                // A broken counter must not take the chat down
                dlog!("rate limit check failed for {}: {e}", source);
                true
            }
        }
    }

    /// Record one performed action against the window.
    pub async fn increment(&self, source: &str, rule: &RateRule) {
        self.increment_at(source, rule, clock::now_secs()).await;
    }

    pub(crate) async fn increment_at(&self, source: &str, rule: &RateRule, now: u64) {
        let stale_before = now.saturating_sub(rule.window_secs) + 1;
        let storage = self.storage.lock().await;
        if let Err(e) = storage.bump_rate_window(source, rule.action, now, stale_before) {
            dlog!("rate limit increment failed for {}: {e}", source);
        }
    }
}
