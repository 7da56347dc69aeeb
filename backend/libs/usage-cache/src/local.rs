//! Process-local cache tier
//!
//! A TTL map behind a reader/writer lock. Expired entries read as absent and
//! are physically removed by a periodic janitor task so memory stays bounded
//! even for keys that are never read again.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone)]
struct LocalEntry {
    value: String,
    expires_at: Instant,
}

impl LocalEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default)]
pub struct LocalTier {
    entries: RwLock<HashMap<String, LocalEntry>>,
}

impl LocalTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: String, ttl: Duration) {
        self.set_until(key, value, Instant::now() + ttl);
    }

    /// Store with an absolute expiry (used to keep an entry's lifetime when
    /// rewriting its value).
    pub fn set_until(&self, key: &str, value: String, expires_at: Instant) {
        self.entries
            .write()
            .insert(key.to_string(), LocalEntry { value, expires_at });
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.read();
        entries
            .get(key)
            .filter(|entry| !entry.is_expired(Instant::now()))
            .map(|entry| entry.value.clone())
    }

    /// Absolute expiry of a live entry.
    pub fn expires_at(&self, key: &str) -> Option<Instant> {
        let entries = self.entries.read();
        entries
            .get(key)
            .filter(|entry| !entry.is_expired(Instant::now()))
            .map(|entry| entry.expires_at)
    }

    /// Returns whether a live entry was removed.
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.entries.write().remove(key);
        removed.is_some_and(|entry| !entry.is_expired(Instant::now()))
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Entries currently held, expired-but-unpurged included.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Purge expired entries every `interval` until the tier is dropped.
    pub fn spawn_janitor(tier: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(tier);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(tier) = weak.upgrade() else {
                    break;
                };
                let purged = tier.purge_expired();
                if purged > 0 {
                    debug!(purged, remaining = tier.len(), "Purged expired local cache entries");
                }
            }
        })
    }
}
