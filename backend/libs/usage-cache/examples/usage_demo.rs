//! Single-node walkthrough: two managers share an in-memory remote tier,
//! record hits, read aggregates and hit the rate limit.
//!
//! Run with: cargo run -p usage-cache --example usage_demo

use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use usage_cache::{
    CacheManager, CacheSettings, MemoryRemote, MemoryUsageStore, RateLimiter, ShardRouter,
    UsageAggregator,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,usage_cache=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_line_number(true),
        )
        .init();

    let settings = CacheSettings {
        rate_limit_per_hour: 3,
        ..CacheSettings::default()
    };

    let remote = MemoryRemote::new();
    let store = Arc::new(MemoryUsageStore::new());
    store.register_client("acme", "Acme Corp");
    store.register_client("globex", "Globex");

    let node_a = CacheManager::with_remote(settings.clone(), remote.clone()).await?;
    let node_b = CacheManager::with_remote(settings.clone(), remote.clone()).await?;
    let agg_a = UsageAggregator::new(node_a.clone(), store.clone());
    let agg_b = UsageAggregator::new(node_b.clone(), store.clone());

    let router = ShardRouter::new(settings.shard_count)?;
    for client in ["acme", "globex"] {
        info!(client, shard = router.shard_for(client), "Shard assignment");
    }

    agg_a.warm().await?;

    for _ in 0..3 {
        agg_a.record_hit("acme", "/v1/search", "10.0.0.1").await?;
    }
    agg_b.record_hit("globex", "/v1/search", "10.0.0.2").await?;

    let daily = agg_b.daily_usage("acme").await?;
    info!(client = %daily.client_id, days = daily.usage.len(), "Daily usage");

    let top = agg_b.refresh_top_clients().await?;
    for entry in &top.top_clients {
        info!(client = %entry.client_id, name = %entry.name, requests = entry.request_count, "Top client");
    }

    let limiter = RateLimiter::new(node_a.clone());
    for attempt in 1..=4 {
        let admission = limiter.check_admission("acme").await;
        info!(
            attempt,
            allowed = admission.allowed,
            remaining = admission.remaining,
            reset_at = %admission.reset_at,
            "Admission"
        );
    }

    remote.set_reachable(false);
    let admission = limiter.check_admission("acme").await;
    info!(
        allowed = admission.allowed,
        fail_open = admission.fail_open,
        available = node_a.is_available(),
        "Admission during remote outage"
    );

    Ok(())
}
