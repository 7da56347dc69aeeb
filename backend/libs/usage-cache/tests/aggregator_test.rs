//! Usage aggregates: stale-while-revalidate refresh, failure isolation and
//! the record-hit write path.

use chrono::{Duration as ChronoDuration, Utc};
use futures_util::future::join_all;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Barrier, Notify};
use usage_cache::{
    CacheError, CacheKey, CacheManager, CacheSettings, ClientUsage, DailyUsageReport,
    Generational, HubBroadcaster, MemoryRemote, MemoryUsageStore, Notification, RemoteTier,
    UsageAggregator,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn settings() -> CacheSettings {
    CacheSettings {
        remote_timeout_ms: 200,
        health_check_interval_secs: 3600,
        ..Default::default()
    }
}

async fn wait_for<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

fn stale<T>(value: T) -> Generational<T> {
    Generational::with_timestamp(value, Utc::now() - ChronoDuration::minutes(10))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_stale_reads_trigger_one_refresh() {
    init_tracing();
    let manager = CacheManager::local_only(settings()).await.unwrap();
    let key = "usage:top:last24h";
    manager
        .set(key, &stale("old".to_string()), Duration::from_secs(3600))
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());

    let start = Arc::new(Barrier::new(50));
    let reads = (0..50).map(|_| {
        let manager = manager.clone();
        let calls = Arc::clone(&calls);
        let gate = Arc::clone(&gate);
        let start = Arc::clone(&start);
        tokio::spawn(async move {
            start.wait().await;
            manager
                .get_or_refresh(key, move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let gate = Arc::clone(&gate);
                    async move {
                        gate.notified().await;
                        Ok("new".to_string())
                    }
                })
                .await
        })
    });

    // The refresh is parked on the gate, so none of these may wait for it
    let results = tokio::time::timeout(Duration::from_secs(1), join_all(reads))
        .await
        .expect("stale reads must not block on the refresh");
    for result in results {
        assert_eq!(result.unwrap().unwrap().value, "old");
    }

    wait_for(|| calls.load(Ordering::SeqCst) == 1).await;
    assert!(manager.is_refreshing(key));

    gate.notify_one();
    wait_for(|| !manager.is_refreshing(key)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let fresh: Generational<String> = manager.get(key).await.unwrap().unwrap();
    assert_eq!(fresh.value, "new");
    assert!(fresh.age() < Duration::from_secs(60));
}

#[tokio::test]
async fn test_failed_background_refresh_keeps_stale_entry() {
    init_tracing();
    let manager = CacheManager::local_only(settings()).await.unwrap();
    let store = Arc::new(MemoryUsageStore::new());
    let aggregator = UsageAggregator::new(manager.clone(), store.clone());

    let key = CacheKey::top_clients();
    let old = stale(vec![ClientUsage {
        client_id: "c1".into(),
        name: "One".into(),
        request_count: 9,
    }]);
    manager
        .set(&key, &old, Duration::from_secs(3600))
        .await
        .unwrap();

    store.set_failing(true);
    let report = aggregator.top_clients().await.unwrap();
    assert_eq!(report.top_clients, old.value);
    assert_eq!(report.generated_at, old.generated_at);

    wait_for(|| !manager.is_refreshing(&key)).await;
    let cached: Generational<Vec<ClientUsage>> = manager.get(&key).await.unwrap().unwrap();
    assert_eq!(cached, old);

    let err = aggregator.refresh_top_clients().await.unwrap_err();
    assert!(matches!(err, CacheError::Store(_)));
    let cached: Generational<Vec<ClientUsage>> = manager.get(&key).await.unwrap().unwrap();
    assert_eq!(cached, old);
}

#[tokio::test]
async fn test_failed_recomputation_on_miss_caches_nothing() {
    let manager = CacheManager::local_only(settings()).await.unwrap();
    let store = Arc::new(MemoryUsageStore::new());
    store.set_failing(true);
    let aggregator = UsageAggregator::new(manager.clone(), store);

    let err = aggregator.top_clients().await.unwrap_err();
    assert!(matches!(err, CacheError::Store(_)));
    assert_eq!(manager.local().get(&CacheKey::top_clients()), None);

    assert!(aggregator.warm().await.is_err());
}

#[tokio::test]
async fn test_warm_then_serve_top_clients() {
    let manager = CacheManager::local_only(settings()).await.unwrap();
    let store = Arc::new(MemoryUsageStore::new());
    store.register_client("c1", "One");
    store.register_client("c2", "Two");
    let aggregator = UsageAggregator::new(manager.clone(), store.clone());

    for _ in 0..3 {
        aggregator.record_hit("c1", "/a", "10.0.0.1").await.unwrap();
    }
    aggregator.record_hit("c2", "/a", "10.0.0.2").await.unwrap();

    aggregator.warm().await.unwrap();
    let report = aggregator.top_clients().await.unwrap();
    assert_eq!(report.period, "last_24_hours");
    assert_eq!(report.total_clients, 2);
    assert_eq!(report.top_clients[0].client_id, "c1");
    assert_eq!(report.top_clients[0].name, "One");
    assert_eq!(report.top_clients[0].request_count, 3);
}

#[tokio::test]
async fn test_record_hit_updates_counters_and_invalidates_everywhere() {
    init_tracing();
    let remote = MemoryRemote::new();
    let store = Arc::new(MemoryUsageStore::new());
    let a = CacheManager::with_remote(settings(), remote.clone()).await.unwrap();
    let b = CacheManager::with_remote(settings(), remote.clone()).await.unwrap();
    let agg_a = UsageAggregator::new(a.clone(), store.clone());
    let agg_b = UsageAggregator::new(b.clone(), store.clone());

    let before = agg_b.daily_usage("c1").await.unwrap();
    assert_eq!(before.usage.len(), 7);
    assert!(before.usage.iter().all(|d| d.request_count == 0));
    assert!(b.local().get(&CacheKey::daily_usage("c1")).is_some());

    let hit_id = agg_a.record_hit("c1", "/api/x", "10.0.0.1").await.unwrap();
    assert_eq!(hit_id, 1);

    let today = Utc::now().date_naive();
    assert_eq!(remote.peek(&CacheKey::total_counter("c1")).as_deref(), Some("1"));
    let daily = remote
        .get(&CacheKey::daily_counter("c1", today))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(daily.payload, "1");
    assert!(daily.ttl.is_some());

    wait_for(|| b.local().get(&CacheKey::daily_usage("c1")).is_none()).await;

    let after: DailyUsageReport = agg_b.daily_usage("c1").await.unwrap();
    let last = after.usage.last().unwrap();
    assert_eq!(last.date, after.end_date);
    assert_eq!(last.request_count, 1);
}

#[tokio::test]
async fn test_record_hit_survives_cache_outage() {
    let remote = MemoryRemote::new();
    let store = Arc::new(MemoryUsageStore::new());
    let manager = CacheManager::with_remote(settings(), remote.clone()).await.unwrap();
    let aggregator = UsageAggregator::new(manager.clone(), store.clone());

    remote.set_reachable(false);
    aggregator.record_hit("c1", "/a", "10.0.0.1").await.unwrap();
    assert_eq!(store.hit_count(), 1);
    assert!(!manager.is_available());
}

#[tokio::test]
async fn test_record_hit_fails_only_on_store_error() {
    let manager = CacheManager::local_only(settings()).await.unwrap();
    let store = Arc::new(MemoryUsageStore::new());
    store.set_failing(true);
    let aggregator = UsageAggregator::new(manager.clone(), store);

    let err = aggregator.record_hit("c1", "/a", "10.0.0.1").await.unwrap_err();
    assert!(matches!(err, CacheError::Store(_)));
    assert_eq!(manager.local().get(&CacheKey::total_counter("c1")), None);
}

#[tokio::test]
async fn test_record_hit_broadcasts_usage_update() {
    let manager = CacheManager::local_only(settings()).await.unwrap();
    let store = Arc::new(MemoryUsageStore::new());
    let broadcaster = Arc::new(HubBroadcaster::new(cache_invalidation::FanoutHub::spawn(
        cache_invalidation::HubConfig::default(),
    )));
    let mut updates = broadcaster.subscribe("c1").await.unwrap();

    let aggregator = UsageAggregator::new(manager, store).with_broadcaster(broadcaster);
    aggregator.record_hit("c1", "/api/x", "10.0.0.1").await.unwrap();

    let raw = tokio::time::timeout(Duration::from_secs(1), updates.next())
        .await
        .unwrap()
        .unwrap();
    let notification: Notification = serde_json::from_str(&raw).unwrap();
    assert_eq!(notification.kind, "usage_update");
    assert_eq!(notification.data["endpoint"], "/api/x");
}
