//! Stale-while-revalidate reads for generational values
//!
//! A [`Generational`] entry records when its value was computed. Reads of a
//! fresh entry return it. Reads of a stale entry (older than the staleness
//! threshold but still within its TTL) return it immediately and start at
//! most one background refresh per key in this process. Misses wait on a
//! single per-key computation.
//!
//! A failed refresh never touches the cached entry.

use crate::error::CacheResult;
use crate::manager::CacheManager;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Cached value plus the time it was computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generational<T> {
    pub generated_at: DateTime<Utc>,
    pub value: T,
}

impl<T> Generational<T> {
    pub fn new(value: T) -> Self {
        Self {
            generated_at: Utc::now(),
            value,
        }
    }

    pub fn with_timestamp(value: T, generated_at: DateTime<Utc>) -> Self {
        Self {
            generated_at,
            value,
        }
    }

    /// Time since generation; zero for timestamps in the future.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.generated_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.age() >= threshold
    }
}

/// Lifetime and staleness threshold for one generational key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    pub ttl: Duration,
    pub stale_after: Duration,
}

/// Removes the key from the in-flight set however the refresh ends.
struct InFlightGuard {
    manager: CacheManager,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.manager.inner.in_flight.lock().remove(&self.key);
    }
}

impl CacheManager {
    /// Policy built from `cache_ttl` and `staleness_threshold`.
    pub fn default_refresh_policy(&self) -> RefreshPolicy {
        RefreshPolicy {
            ttl: self.settings().cache_ttl(),
            stale_after: self.settings().staleness_threshold(),
        }
    }

    /// [`get_or_refresh_with`](Self::get_or_refresh_with) under the default policy.
    pub async fn get_or_refresh<T, F, Fut>(&self, key: &str, refresh: F) -> CacheResult<Generational<T>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CacheResult<T>> + Send + 'static,
    {
        let policy = self.default_refresh_policy();
        self.get_or_refresh_with(key, policy, refresh).await
    }

    /// Serve `key` with stale-while-revalidate semantics.
    ///
    /// On a miss the caller waits for `refresh` (single-flighted per key) and
    /// gets its error if it fails. On a stale hit the stale value is
    /// returned and `refresh` runs in the background unless a refresh for
    /// the key is already in flight.
    pub async fn get_or_refresh_with<T, F, Fut>(
        &self,
        key: &str,
        policy: RefreshPolicy,
        refresh: F,
    ) -> CacheResult<Generational<T>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CacheResult<T>> + Send + 'static,
    {
        if let Some(cached) = self.read_generational::<T>(key).await {
            if cached.is_stale(policy.stale_after) {
                self.spawn_refresh(key, policy, refresh);
            }
            return Ok(cached);
        }

        let lock = {
            let mut locks = self.inner.fill_locks.lock();
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        let result = {
            let _fill = lock.lock().await;

            // Another caller may have filled it while we waited
            match self.read_generational::<T>(key).await {
                Some(cached) => Ok(cached),
                None => self.refresh_now(key, policy, &refresh).await,
            }
        };

        {
            // Clones are only taken under this lock, so a count of one means
            // nobody else holds or waits on the fill lock
            let mut locks = self.inner.fill_locks.lock();
            drop(lock);
            if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
                locks.remove(key);
            }
        }

        result
    }

    /// Whether a background refresh for `key` is running in this process.
    pub fn is_refreshing(&self, key: &str) -> bool {
        self.inner.in_flight.lock().contains(key)
    }

    async fn read_generational<T: DeserializeOwned>(&self, key: &str) -> Option<Generational<T>> {
        match self.get::<Generational<T>>(key).await {
            Ok(found) => found,
            Err(e) => {
                warn!(key = %key, error = %e, "Treating unreadable generational entry as a miss");
                None
            }
        }
    }

    /// Compute, store with a fresh generation timestamp and return.
    /// On failure nothing is written.
    async fn refresh_now<T, F, Fut>(
        &self,
        key: &str,
        policy: RefreshPolicy,
        refresh: &F,
    ) -> CacheResult<Generational<T>>
    where
        T: Serialize + Sync,
        F: Fn() -> Fut,
        Fut: Future<Output = CacheResult<T>>,
    {
        let value = match refresh().await {
            Ok(value) => value,
            Err(e) => {
                self.inner.metrics.record_refresh(key, false);
                warn!(key = %key, error = %e, "Refresh failed, keeping existing entry");
                return Err(e);
            }
        };
        self.inner.metrics.record_refresh(key, true);

        let fresh = Generational::new(value);
        if let Err(e) = self.set(key, &fresh, policy.ttl).await {
            warn!(key = %key, error = %e, "Failed to store refreshed value");
        }
        debug!(key = %key, "Refreshed generational entry");
        Ok(fresh)
    }

    fn spawn_refresh<T, F, Fut>(&self, key: &str, policy: RefreshPolicy, refresh: F)
    where
        T: Serialize + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CacheResult<T>> + Send + 'static,
    {
        if !self.inner.in_flight.lock().insert(key.to_string()) {
            debug!(key = %key, "Refresh already in flight");
            return;
        }

        let guard = InFlightGuard {
            manager: self.clone(),
            key: key.to_string(),
        };

        tokio::spawn(async move {
            let manager = guard.manager.clone();
            let _ = manager.refresh_now(&guard.key, policy, &refresh).await;
            drop(guard);
        });
    }
}
