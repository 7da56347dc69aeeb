//! Cache metrics for observability

use crate::keys::CacheKey;
use prometheus::{CounterVec, Opts, Registry};
use std::sync::OnceLock;

static METRICS: OnceLock<CacheMetricsInner> = OnceLock::new();

struct CacheMetricsInner {
    hits: CounterVec,
    misses: CounterVec,
    remote_errors: CounterVec,
    local_fallbacks: CounterVec,
    invalidated_keys: CounterVec,
    refreshes: CounterVec,
    admissions: CounterVec,
}

impl CacheMetricsInner {
    fn new() -> Self {
        Self {
            hits: CounterVec::new(
                Opts::new("usage_cache_hits_total", "Total cache hits"),
                &["entity", "tier"],
            )
            .expect("valid metric definition"),
            misses: CounterVec::new(
                Opts::new("usage_cache_misses_total", "Total cache misses"),
                &["entity"],
            )
            .expect("valid metric definition"),
            remote_errors: CounterVec::new(
                Opts::new(
                    "usage_cache_remote_errors_total",
                    "Total shared tier failures",
                ),
                &["operation", "error_type"],
            )
            .expect("valid metric definition"),
            local_fallbacks: CounterVec::new(
                Opts::new(
                    "usage_cache_local_fallbacks_total",
                    "Operations served by the local tier while the shared tier was unavailable",
                ),
                &["operation"],
            )
            .expect("valid metric definition"),
            invalidated_keys: CounterVec::new(
                Opts::new(
                    "usage_cache_invalidated_keys_total",
                    "Total keys dropped by invalidation events",
                ),
                &["action"],
            )
            .expect("valid metric definition"),
            refreshes: CounterVec::new(
                Opts::new(
                    "usage_cache_refreshes_total",
                    "Total aggregate recomputations",
                ),
                &["entity", "outcome"],
            )
            .expect("valid metric definition"),
            admissions: CounterVec::new(
                Opts::new(
                    "usage_cache_admissions_total",
                    "Total rate limit decisions",
                ),
                &["decision"],
            )
            .expect("valid metric definition"),
        }
    }

    fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.hits.clone()))?;
        registry.register(Box::new(self.misses.clone()))?;
        registry.register(Box::new(self.remote_errors.clone()))?;
        registry.register(Box::new(self.local_fallbacks.clone()))?;
        registry.register(Box::new(self.invalidated_keys.clone()))?;
        registry.register(Box::new(self.refreshes.clone()))?;
        registry.register(Box::new(self.admissions.clone()))?;
        Ok(())
    }
}

fn get_metrics() -> &'static CacheMetricsInner {
    METRICS.get_or_init(CacheMetricsInner::new)
}

fn entity(key: &str) -> &str {
    CacheKey::entity_type(key).unwrap_or("unknown")
}

/// Cache tier that answered a read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Local,
    Remote,
}

impl Tier {
    fn as_str(&self) -> &'static str {
        match self {
            Tier::Local => "local",
            Tier::Remote => "remote",
        }
    }
}

/// Cache metrics wrapper
#[derive(Clone, Default)]
pub struct CacheMetrics;

impl CacheMetrics {
    pub fn new() -> Self {
        Self
    }

    /// Register metrics with a Prometheus registry
    pub fn register(registry: &Registry) -> Result<(), prometheus::Error> {
        get_metrics().register(registry)
    }

    pub fn record_hit(&self, key: &str, tier: Tier) {
        get_metrics()
            .hits
            .with_label_values(&[entity(key), tier.as_str()])
            .inc();
    }

    pub fn record_miss(&self, key: &str) {
        get_metrics().misses.with_label_values(&[entity(key)]).inc();
    }

    pub fn record_remote_error(&self, operation: &str, error_type: &str) {
        get_metrics()
            .remote_errors
            .with_label_values(&[operation, error_type])
            .inc();
    }

    pub fn record_local_fallback(&self, operation: &str) {
        get_metrics()
            .local_fallbacks
            .with_label_values(&[operation])
            .inc();
    }

    pub fn record_invalidated(&self, action: &str, keys: usize) {
        get_metrics()
            .invalidated_keys
            .with_label_values(&[action])
            .inc_by(keys as f64);
    }

    pub fn record_refresh(&self, key: &str, success: bool) {
        let outcome = if success { "success" } else { "error" };
        get_metrics()
            .refreshes
            .with_label_values(&[entity(key), outcome])
            .inc();
    }

    pub fn record_admission(&self, allowed: bool, fail_open: bool) {
        let decision = match (allowed, fail_open) {
            (true, true) => "fail_open",
            (true, false) => "allowed",
            (false, _) => "denied",
        };
        get_metrics()
            .admissions
            .with_label_values(&[decision])
            .inc();
    }
}
