//! Cache key schema
//!
//! Every component builds keys through [`CacheKey`] so that invalidation rule
//! templates and readers agree on the exact format. Keys are unversioned to
//! stay readable by existing producers sharing the same Redis.

use chrono::{DateTime, NaiveDate, Utc};

/// Hour bucket format used in rate-limit keys
pub const HOUR_BUCKET_FORMAT: &str = "%Y-%m-%d-%H";

/// Day bucket format used in daily counter keys
pub const DAY_BUCKET_FORMAT: &str = "%Y-%m-%d";

/// Cache key builder
pub struct CacheKey;

impl CacheKey {
    // ============= Aggregates =============

    /// Per-client daily usage report
    /// Format: usage:daily:{client_id}
    pub fn daily_usage(client_id: &str) -> String {
        format!("usage:daily:{}", client_id)
    }

    /// Global top-clients report (generational)
    /// Format: usage:top:last24h
    pub fn top_clients() -> String {
        "usage:top:last24h".to_string()
    }

    /// Cached client record
    /// Format: client:{client_id}
    pub fn client(client_id: &str) -> String {
        format!("client:{}", client_id)
    }

    // ============= Counters =============

    /// Format: counter:daily:{client_id}:{YYYY-MM-DD}
    pub fn daily_counter(client_id: &str, day: NaiveDate) -> String {
        format!(
            "counter:daily:{}:{}",
            client_id,
            day.format(DAY_BUCKET_FORMAT)
        )
    }

    /// Format: counter:total:{client_id}
    pub fn total_counter(client_id: &str) -> String {
        format!("counter:total:{}", client_id)
    }

    /// Hourly admission counter
    /// Format: rate_limit:{client_id}:{YYYY-MM-DD-HH}
    pub fn rate_limit(client_id: &str, at: DateTime<Utc>) -> String {
        format!("rate_limit:{}:{}", client_id, at.format(HOUR_BUCKET_FORMAT))
    }

    // ============= Utility =============

    /// Leading segment of a key, used as the metrics label
    pub fn entity_type(key: &str) -> Option<&str> {
        key.split(':').next().filter(|s| !s.is_empty() && *s != key)
    }
}
