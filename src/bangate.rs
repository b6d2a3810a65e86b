//! Ban lookup with a short-lived cache.
//!
//! Admission checks every new connection against `banned_ips`; the cache
//! keeps that from hammering the database when one source reconnects in a
//! tight loop.  Admin mutations bump a version counter, which invalidates
//! every cached entry at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::storage::{Storage, StorageError};

/// How long a cached verdict stays valid.
pub const BAN_CACHE_TTL: Duration = Duration::from_secs(30);

struct CacheEntry {
    banned: bool,
    cached_at: Instant,
    version: u64,
}

#[derive(Clone)]
pub struct BanGate {
    storage: Arc<Mutex<Storage>>,
    cache: Arc<StdMutex<HashMap<String, CacheEntry>>>,
    version: Arc<AtomicU64>,
}

impl BanGate {
    pub fn new(storage: Arc<Mutex<Storage>>) -> Self {
        Self {
            storage,
            cache: Arc::new(StdMutex::new(HashMap::new())),
            version: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Whether the source address is banned.  Errors mean the authoritative
    /// read failed; callers must refuse admission rather than guess.
    pub async fn is_banned(&self, source: &str) -> Result<bool, StorageError> {
        let version = self.version.load(Ordering::Acquire);
        {
            let cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.get(source) {
                if entry.version == version && entry.cached_at.elapsed() < BAN_CACHE_TTL {
                    return Ok(entry.banned);
                }
            }
        }

        let banned = self.storage.lock().await.is_banned(source)?;

        let mut cache = self.cache.lock().unwrap();
        cache.insert(
            source.to_string(),
            CacheEntry {
                banned,
                cached_at: Instant::now(),
                version,
            },
        );
        Ok(banned)
    }

    /// Drop every cached verdict.  Called after any admin ban mutation.
    pub fn invalidate(&self) {
        self.version.fetch_add(1, Ordering::Release);
    }
}
