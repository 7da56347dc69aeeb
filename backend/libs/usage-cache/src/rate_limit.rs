//! Fixed-hour-window admission control
//!
//! One counter per client per clock hour (`rate_limit:{client}:{YYYY-MM-DD-HH}`).
//! The first increment of a bucket stamps a one hour TTL on it. A failed stamp
//! is retried on later checks of the same bucket until it lands, so no bucket
//! is left without an expiry. If the increment itself fails the request is
//! admitted: a cache outage must not take traffic down with it.

use crate::keys::CacheKey;
use crate::manager::CacheManager;
use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Lifetime of one hour bucket
pub const BUCKET_TTL: Duration = Duration::from_secs(3600);

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Admission {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Start of the next hour bucket
    pub reset_at: DateTime<Utc>,
    /// Admitted only because the counter could not be updated
    pub fail_open: bool,
}

#[derive(Clone)]
pub struct RateLimiter {
    cache: CacheManager,
    limit_per_hour: u32,
    /// Buckets whose TTL stamp failed
    unstamped: Arc<Mutex<HashSet<String>>>,
}

impl RateLimiter {
    /// Limiter using the manager's configured `rate_limit_per_hour`.
    pub fn new(cache: CacheManager) -> Self {
        let limit_per_hour = cache.settings().rate_limit_per_hour;
        Self::with_limit(cache, limit_per_hour)
    }

    pub fn with_limit(cache: CacheManager, limit_per_hour: u32) -> Self {
        Self {
            cache,
            limit_per_hour,
            unstamped: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn limit_per_hour(&self) -> u32 {
        self.limit_per_hour
    }

    pub async fn check_admission(&self, client_id: &str) -> Admission {
        self.check_admission_at(client_id, Utc::now()).await
    }

    /// Check against the bucket containing `now`.
    pub async fn check_admission_at(&self, client_id: &str, now: DateTime<Utc>) -> Admission {
        let key = CacheKey::rate_limit(client_id, now);
        let reset_at = next_bucket_start(now);

        let count = match self.cache.increment(&key, 1).await {
            Ok(count) => count,
            Err(e) => {
                warn!(
                    client_id = %client_id,
                    error = %e,
                    "Rate limit counter unavailable (allowing request)"
                );
                self.cache.inner.metrics.record_admission(true, true);
                return Admission {
                    allowed: true,
                    limit: self.limit_per_hour,
                    remaining: self.limit_per_hour,
                    reset_at,
                    fail_open: true,
                };
            }
        };

        let retry_stamp = self.unstamped.lock().contains(&key);
        if count == 1 || retry_stamp {
            self.stamp_bucket(&key).await;
        }

        let allowed = count <= i64::from(self.limit_per_hour);
        let remaining = if allowed {
            (i64::from(self.limit_per_hour) - count) as u32
        } else {
            0
        };

        self.cache.inner.metrics.record_admission(allowed, false);
        debug!(
            client_id = %client_id,
            count,
            limit = self.limit_per_hour,
            allowed,
            "Rate limit check"
        );

        Admission {
            allowed,
            limit: self.limit_per_hour,
            remaining,
            reset_at,
            fail_open: false,
        }
    }

    async fn stamp_bucket(&self, key: &str) {
        // A stamp taken by the local tier says nothing about the shared copy
        let on_shared_tier = self.cache.is_available();
        match self.cache.expire(key, BUCKET_TTL).await {
            Ok(_) if on_shared_tier => {
                self.unstamped.lock().remove(key);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to set rate limit bucket TTL, will retry");
                self.unstamped.lock().insert(key.to_string());
            }
        }
    }

    /// Number of buckets still waiting for their TTL.
    pub fn pending_ttl_stamps(&self) -> usize {
        self.unstamped.lock().len()
    }
}

fn next_bucket_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let hour = ChronoDuration::hours(1);
    now.duration_trunc(hour).unwrap_or(now) + hour
}
