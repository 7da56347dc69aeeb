//! Two-tier cache façade
//!
//! One [`CacheManager`] per process, cloned into every component that needs
//! it. Reads go local first, then remote with a short local backfill. Writes
//! go to both tiers. Counters use the shared tier's atomic increment while it
//! is reachable and fall back to a non-atomic local increment otherwise.
//!
//! Availability is a single flag: any remote failure or timeout clears it,
//! and only the health monitor sets it again after a successful ping.

use crate::config::CacheSettings;
use crate::error::{CacheError, CacheResult};
use crate::local::LocalTier;
use crate::metrics::{CacheMetrics, Tier};
use crate::remote::{RedisRemote, RemoteTier};
use cache_invalidation::{
    spawn_listener, InvalidationAction, InvalidationError, InvalidationEvent, InvalidationStats,
    StatsCollector,
};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub(crate) struct ManagerInner {
    pub(crate) settings: CacheSettings,
    pub(crate) local: Arc<LocalTier>,
    remote: Option<Arc<dyn RemoteTier>>,
    available: AtomicBool,
    pub(crate) metrics: CacheMetrics,
    stats: StatsCollector,
    /// The single invalidation subscription; async lock so concurrent
    /// recoveries cannot both subscribe
    listener: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    /// Keys with a background refresh running
    pub(crate) in_flight: parking_lot::Mutex<HashSet<String>>,
    /// Per-key locks serializing fills after a miss
    pub(crate) fill_locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
        if let Some(handle) = self.listener.get_mut().take() {
            handle.abort();
        }
    }
}

/// Process-wide cache handle. Cheap to clone; background tasks stop when the
/// last clone is dropped.
#[derive(Clone)]
pub struct CacheManager {
    pub(crate) inner: Arc<ManagerInner>,
}

impl CacheManager {
    /// Build a manager over the local tier and an optional shared tier.
    ///
    /// An unreachable shared tier is not an error: the manager starts in
    /// local-only mode and the health monitor switches over once it answers.
    pub async fn new(
        settings: CacheSettings,
        remote: Option<Arc<dyn RemoteTier>>,
    ) -> CacheResult<Self> {
        settings.validate()?;

        let local = Arc::new(LocalTier::new());
        let janitor = LocalTier::spawn_janitor(&local, settings.purge_interval());

        let inner = Arc::new(ManagerInner {
            settings,
            local,
            remote,
            available: AtomicBool::new(false),
            metrics: CacheMetrics::new(),
            stats: StatsCollector::new(),
            listener: tokio::sync::Mutex::new(None),
            tasks: parking_lot::Mutex::new(vec![janitor]),
            in_flight: parking_lot::Mutex::new(HashSet::new()),
            fill_locks: parking_lot::Mutex::new(HashMap::new()),
        });

        if inner.remote.is_some() {
            inner.check_health().await;
            let monitor = spawn_health_monitor(&inner);
            inner.tasks.lock().push(monitor);

            if !inner.is_available() {
                warn!("Remote cache unreachable at startup, running on local tier only");
            }
        } else {
            info!("Cache manager running on local tier only");
        }

        Ok(Self { inner })
    }

    pub async fn local_only(settings: CacheSettings) -> CacheResult<Self> {
        Self::new(settings, None).await
    }

    pub async fn with_remote<R>(settings: CacheSettings, remote: R) -> CacheResult<Self>
    where
        R: RemoteTier + 'static,
    {
        Self::new(settings, Some(Arc::new(remote))).await
    }

    /// Connect to `settings.redis_url` when set. A failed connection leaves
    /// the manager local-only for the life of the process.
    pub async fn connect(settings: CacheSettings) -> CacheResult<Self> {
        settings.validate()?;

        let remote: Option<Arc<dyn RemoteTier>> = match settings.redis_url.as_deref() {
            Some(url) => match RedisRemote::connect(url, settings.connect_timeout()).await {
                Ok(remote) => Some(Arc::new(remote)),
                Err(e) => {
                    warn!(error = %e, "Failed to connect to Redis, using local cache only");
                    None
                }
            },
            None => None,
        };

        Self::new(settings, remote).await
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.inner.settings
    }

    /// Whether the shared tier is currently in use.
    pub fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    /// Direct access to this process's local tier.
    pub fn local(&self) -> &LocalTier {
        &self.inner.local
    }

    pub fn invalidation_stats(&self) -> InvalidationStats {
        self.inner.stats.snapshot()
    }

    /// Ping the shared tier now instead of waiting for the next monitor tick.
    pub async fn check_health(&self) {
        self.inner.check_health().await;
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        let inner = &self.inner;

        if let Some(raw) = inner.local.get(key) {
            inner.metrics.record_hit(key, Tier::Local);
            debug!(key = %key, "Local cache hit");
            return inner.decode(key, &raw).map(Some);
        }

        if let Some(remote) = inner.remote() {
            match inner.guarded("get", remote.get(key)).await {
                Ok(Some(found)) => {
                    let value = inner.decode(key, &found.payload)?;
                    let backfill = found
                        .ttl
                        .map_or(inner.settings.backfill_ttl(), |ttl| {
                            ttl.min(inner.settings.backfill_ttl())
                        });
                    if !backfill.is_zero() {
                        inner.local.set(key, found.payload, backfill);
                    }
                    inner.metrics.record_hit(key, Tier::Remote);
                    debug!(key = %key, backfill_ms = backfill.as_millis() as u64, "Remote cache hit");
                    return Ok(Some(value));
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(key = %key, error = %e, "Remote read failed, treating as miss");
                }
            }
        }

        inner.metrics.record_miss(key);
        debug!(key = %key, "Cache miss");
        Ok(None)
    }

    /// Write to the local tier, then to the shared tier if available. A
    /// shared-tier failure is returned but the local write stands.
    pub async fn set<T>(&self, key: &str, value: &T, ttl: Duration) -> CacheResult<()>
    where
        T: Serialize + ?Sized + Sync,
    {
        let raw = serde_json::to_string(value)?;
        self.set_raw(key, raw, ttl).await
    }

    pub async fn set_raw(&self, key: &str, raw: String, ttl: Duration) -> CacheResult<()> {
        let inner = &self.inner;
        inner.local.set(key, raw.clone(), ttl);

        if let Some(remote) = inner.remote() {
            inner.guarded("set", remote.set(key, &raw, ttl)).await?;
        }

        debug!(key = %key, ttl_secs = ttl.as_secs(), "Cache set");
        Ok(())
    }

    /// Remove from both tiers. Absent keys are not an error.
    pub async fn delete(&self, key: &str) -> CacheResult<()> {
        let inner = &self.inner;
        inner.local.delete(key);

        if let Some(remote) = inner.remote() {
            inner.guarded("delete", remote.del(key)).await?;
        }

        debug!(key = %key, "Cache delete");
        Ok(())
    }

    /// Add `delta` to the counter at `key` and return the new value.
    ///
    /// With the shared tier available this is a single atomic remote
    /// increment. Otherwise it is a local read followed by a local write,
    /// atomic only for a single caller; concurrent fallback increments can
    /// lose updates. A shared-tier failure during the call is returned (and
    /// switches the manager to local mode for later calls).
    pub async fn increment(&self, key: &str, delta: i64) -> CacheResult<i64> {
        let inner = &self.inner;

        if let Some(remote) = inner.remote() {
            let value = inner.guarded("increment", remote.incr_by(key, delta)).await?;
            // Drop any backfilled copy so local reads see the new count
            inner.local.delete(key);
            return Ok(value);
        }

        inner.metrics.record_local_fallback("increment");

        let current: i64 = match inner.local.get(key) {
            Some(raw) => inner.decode(key, &raw)?,
            None => 0,
        };
        let expires_at = inner
            .local
            .expires_at(key)
            .unwrap_or_else(|| Instant::now() + inner.settings.local_default_ttl());

        let next = current.saturating_add(delta);
        inner.local.set_until(key, next.to_string(), expires_at);

        debug!(key = %key, value = next, "Local fallback increment");
        Ok(next)
    }

    /// Re-stamp the lifetime of `key` on both tiers. Returns whether the key
    /// existed in the tier of record.
    pub async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        let inner = &self.inner;

        let local_hit = match inner.local.get(key) {
            Some(raw) => {
                inner.local.set(key, raw, ttl);
                true
            }
            None => false,
        };

        match inner.remote() {
            Some(remote) => inner.guarded("expire", remote.expire(key, ttl)).await,
            None => Ok(local_hit),
        }
    }

    /// Announce new usage for `subject_id` to every process.
    pub async fn publish_invalidation(&self, subject_id: &str) -> CacheResult<()> {
        self.publish_event(InvalidationAction::UsageUpdated, subject_id)
            .await
    }

    /// Purge the derived keys of `subject_id` here, then broadcast the event
    /// so every other process does the same. Without the shared tier only
    /// this process is purged; elsewhere staleness is bounded by TTL.
    pub async fn publish_event(
        &self,
        action: InvalidationAction,
        subject_id: &str,
    ) -> CacheResult<()> {
        let inner = &self.inner;
        let event = InvalidationEvent::new(action, subject_id);

        inner.apply_invalidation(&event, true).await;

        let Some(remote) = inner.remote() else {
            debug!(
                action = %event.action,
                subject = %subject_id,
                "Remote cache unavailable, invalidation not broadcast"
            );
            return Ok(());
        };

        let payload = event.to_payload()?;
        let receivers = inner
            .guarded(
                "publish",
                remote.publish(&inner.settings.invalidation_channel, &payload),
            )
            .await?;
        inner.stats.record_publish();

        debug!(
            action = %event.action,
            subject = %subject_id,
            receivers,
            "Published invalidation event"
        );
        Ok(())
    }
}

impl ManagerInner {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// The shared tier, if configured and currently available.
    fn remote(&self) -> Option<&Arc<dyn RemoteTier>> {
        if self.is_available() {
            self.remote.as_ref()
        } else {
            None
        }
    }

    fn decode<T: DeserializeOwned>(&self, key: &str, raw: &str) -> CacheResult<T> {
        serde_json::from_str(raw).map_err(|e| {
            warn!(key = %key, error = %e, "Dropping undecodable cache entry");
            self.local.delete(key);
            CacheError::Serialization(e)
        })
    }

    /// Run a shared-tier call under the remote timeout. Remote failures and
    /// timeouts switch the manager to local mode.
    async fn guarded<T, F>(&self, operation: &'static str, call: F) -> CacheResult<T>
    where
        F: Future<Output = CacheResult<T>>,
    {
        let limit = self.settings.remote_timeout();
        let result = match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(limit)),
        };

        if let Err(e) = &result {
            self.metrics.record_remote_error(operation, error_type(e));
            if e.is_remote_failure() {
                self.mark_unavailable(operation, e);
            }
        }
        result
    }

    fn mark_unavailable(&self, operation: &str, error: &CacheError) {
        if self.available.swap(false, Ordering::SeqCst) {
            warn!(
                operation = %operation,
                error = %error,
                "Remote cache unavailable, degrading to local tier"
            );
        }
    }

    async fn check_health(self: &Arc<Self>) {
        let Some(remote) = self.remote.as_ref() else {
            return;
        };

        if self.guarded("ping", remote.ping()).await.is_err() {
            return;
        }

        if !self.available.swap(true, Ordering::SeqCst) {
            info!("Remote cache reachable, using shared tier");
        }

        if let Err(e) = self.ensure_listener().await {
            warn!(error = %e, "Failed to open invalidation subscription");
        }
    }

    /// Open the invalidation subscription unless one is already running.
    async fn ensure_listener(self: &Arc<Self>) -> CacheResult<()> {
        let Some(remote) = self.remote.as_ref() else {
            return Ok(());
        };

        let mut slot = self.listener.lock().await;
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }

        let channel = self.settings.invalidation_channel.clone();
        let stream = self.guarded("subscribe", remote.subscribe(&channel)).await?;

        let weak: Weak<ManagerInner> = Arc::downgrade(self);
        let handle = spawn_listener(stream, self.stats.clone(), move |event| {
            let weak = weak.clone();
            async move {
                let inner = weak.upgrade().ok_or_else(|| {
                    InvalidationError::HandlerFailed("cache manager dropped".to_string())
                })?;
                Ok(inner.apply_invalidation(&event, false).await)
            }
        });
        *slot = Some(handle);

        info!(channel = %channel, "Invalidation listener started");
        Ok(())
    }

    /// Delete every key the rules derive from `event` locally, and from the
    /// shared tier too when `purge_remote` is set. The publisher purges the
    /// shared tier once; listeners only drop their local copies. Idempotent,
    /// so duplicate deliveries are harmless.
    async fn apply_invalidation(&self, event: &InvalidationEvent, purge_remote: bool) -> usize {
        let keys = self.settings.invalidation_rules.keys_for(event);

        for key in &keys {
            self.local.delete(key);
            if !purge_remote {
                continue;
            }
            if let Some(remote) = self.remote() {
                if let Err(e) = self.guarded("invalidate", remote.del(key)).await {
                    warn!(key = %key, error = %e, "Failed to invalidate remote key");
                }
            }
        }

        self.metrics
            .record_invalidated(event.action.as_str(), keys.len());
        debug!(
            action = %event.action,
            subject = %event.subject_id,
            keys = keys.len(),
            "Applied invalidation"
        );
        keys.len()
    }
}

fn spawn_health_monitor(inner: &Arc<ManagerInner>) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    let period = inner.settings.health_check_interval();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            inner.check_health().await;
        }
    })
}

fn error_type(error: &CacheError) -> &'static str {
    match error {
        CacheError::Timeout(_) => "timeout",
        CacheError::RemoteUnavailable(_) => "unavailable",
        CacheError::RemoteCommand(_) => "command",
        CacheError::Serialization(_) => "serialization",
        CacheError::Configuration(_) | CacheError::Store(_) => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Report {
        total: u64,
    }

    fn settings() -> CacheSettings {
        CacheSettings {
            remote_timeout_ms: 200,
            health_check_interval_secs: 3600,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_local_only_round_trip() {
        let manager = CacheManager::local_only(settings()).await.unwrap();
        assert!(!manager.is_available());

        manager
            .set("usage:daily:c1", &Report { total: 7 }, Duration::from_secs(60))
            .await
            .unwrap();
        let got: Option<Report> = manager.get("usage:daily:c1").await.unwrap();
        assert_eq!(got, Some(Report { total: 7 }));

        manager.delete("usage:daily:c1").await.unwrap();
        let got: Option<Report> = manager.get("usage:daily:c1").await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_remote_hit_backfills_with_short_ttl() {
        let remote = MemoryRemote::new();
        let manager = CacheManager::with_remote(settings(), remote.clone())
            .await
            .unwrap();
        assert!(manager.is_available());

        remote
            .set("client:c1", "{\"total\":1}", Duration::from_secs(3600))
            .await
            .unwrap();

        let got: Option<Report> = manager.get("client:c1").await.unwrap();
        assert_eq!(got, Some(Report { total: 1 }));

        let expiry = manager.local().expires_at("client:c1").unwrap();
        let remaining = expiry.saturating_duration_since(Instant::now());
        assert!(remaining <= manager.settings().backfill_ttl());
    }

    #[tokio::test]
    async fn test_backfill_never_outlives_remote_entry() {
        let remote = MemoryRemote::new();
        let manager = CacheManager::with_remote(settings(), remote.clone())
            .await
            .unwrap();

        remote
            .set("client:c2", "{\"total\":2}", Duration::from_secs(2))
            .await
            .unwrap();
        let _: Option<Report> = manager.get("client:c2").await.unwrap();

        let expiry = manager.local().expires_at("client:c2").unwrap();
        assert!(expiry.saturating_duration_since(Instant::now()) <= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_undecodable_local_entry_is_dropped() {
        let manager = CacheManager::local_only(settings()).await.unwrap();
        manager
            .local()
            .set("client:x", "not json".into(), Duration::from_secs(60));

        let err = manager.get::<Report>("client:x").await.unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
        assert_eq!(manager.local().get("client:x"), None);
    }

    #[tokio::test]
    async fn test_remote_failure_on_read_is_a_miss_and_degrades() {
        let remote = MemoryRemote::new();
        let manager = CacheManager::with_remote(settings(), remote.clone())
            .await
            .unwrap();

        remote.set_reachable(false);
        let got: Option<Report> = manager.get("client:none").await.unwrap();
        assert_eq!(got, None);
        assert!(!manager.is_available());

        remote.set_reachable(true);
        manager.check_health().await;
        assert!(manager.is_available());
    }

    #[tokio::test]
    async fn test_set_reports_remote_failure_but_keeps_local_write() {
        let remote = MemoryRemote::new();
        let manager = CacheManager::with_remote(settings(), remote.clone())
            .await
            .unwrap();

        remote.set_reachable(false);
        let result = manager
            .set("client:c3", &Report { total: 3 }, Duration::from_secs(60))
            .await;
        assert!(result.unwrap_err().is_remote_failure());

        let got: Option<Report> = manager.get("client:c3").await.unwrap();
        assert_eq!(got, Some(Report { total: 3 }));
    }

    #[tokio::test]
    async fn test_increment_uses_remote_when_available() {
        let remote = MemoryRemote::new();
        let manager = CacheManager::with_remote(settings(), remote.clone())
            .await
            .unwrap();

        assert_eq!(manager.increment("counter:total:c1", 1).await.unwrap(), 1);
        assert_eq!(manager.increment("counter:total:c1", 2).await.unwrap(), 3);
        assert_eq!(remote.peek("counter:total:c1").as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_increment_failure_is_returned_then_falls_back() {
        let remote = MemoryRemote::new();
        let manager = CacheManager::with_remote(settings(), remote.clone())
            .await
            .unwrap();

        remote.set_reachable(false);
        let err = manager.increment("counter:total:c1", 1).await.unwrap_err();
        assert!(err.is_remote_failure());
        assert!(!manager.is_available());

        assert_eq!(manager.increment("counter:total:c1", 1).await.unwrap(), 1);
        assert_eq!(manager.increment("counter:total:c1", 1).await.unwrap(), 2);
        assert_eq!(remote.peek("counter:total:c1"), None);
    }

    #[tokio::test]
    async fn test_local_increment_keeps_expiry() {
        let manager = CacheManager::local_only(settings()).await.unwrap();
        manager.increment("rate_limit:c1:x", 1).await.unwrap();
        assert!(manager
            .expire("rate_limit:c1:x", Duration::from_secs(3600))
            .await
            .unwrap());
        let expiry = manager.local().expires_at("rate_limit:c1:x").unwrap();

        manager.increment("rate_limit:c1:x", 1).await.unwrap();
        assert_eq!(manager.local().expires_at("rate_limit:c1:x"), Some(expiry));
    }

    #[tokio::test]
    async fn test_remote_timeout_degrades() {
        let remote = MemoryRemote::new();
        let manager = CacheManager::with_remote(settings(), remote.clone())
            .await
            .unwrap();

        remote.set_latency(Duration::from_millis(500));
        let err = manager.increment("counter:total:slow", 1).await.unwrap_err();
        assert!(matches!(err, CacheError::Timeout(_)));
        assert!(!manager.is_available());
    }

    #[tokio::test]
    async fn test_publish_without_remote_purges_locally() {
        let manager = CacheManager::local_only(settings()).await.unwrap();
        manager
            .set("usage:daily:c9", &Report { total: 1 }, Duration::from_secs(60))
            .await
            .unwrap();

        manager.publish_invalidation("c9").await.unwrap();
        assert_eq!(manager.local().get("usage:daily:c9"), None);
    }

    #[tokio::test]
    async fn test_invalid_settings_rejected() {
        let bad = CacheSettings {
            shard_count: 0,
            ..Default::default()
        };
        assert!(matches!(
            CacheManager::local_only(bad).await,
            Err(CacheError::Configuration(_))
        ));
    }
}
