//! Shared application state handed to every handler.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;

use crate::bangate::BanGate;
use crate::clock;
use crate::counters::Counters;
use crate::matchmaker::Matchmaker;
use crate::ratelimit::RateLimiter;
use crate::registry::ConnectionRegistry;
use crate::router::ChatContext;
use crate::storage::Storage;

#[derive(Clone)]
pub struct AppState {
    /// Everything the realtime session plane needs.
    pub chat: ChatContext,
    pub bans: BanGate,
    pub media_dir: PathBuf,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(storage: Storage, media_dir: PathBuf) -> Self {
        let storage = Arc::new(Mutex::new(storage));
        let chat = ChatContext {
            registry: ConnectionRegistry::new(),
            matchmaker: Matchmaker::new(),
            limiter: RateLimiter::new(Arc::clone(&storage)),
            counters: Counters::new(clock::now_secs()),
            storage: Arc::clone(&storage),
        };
        Self {
            chat,
            bans: BanGate::new(storage),
            media_dir,
            started_at: Instant::now(),
        }
    }
}
