//! Usage counting and caching layer
//!
//! Serves API usage counters and small aggregates with bounded staleness:
//! - Two tiers: process-local map plus a shared remote (Redis in production)
//! - Atomic remote counters, with a local fallback while Redis is down
//! - Cross-process invalidation over pub/sub, driven by declarative rules
//! - Stale-while-revalidate for generational aggregates
//! - Hourly fixed-window rate limiting (fail-open)
//! - Deterministic client → shard placement
//!
//! # Example
//!
//! ```no_run
//! use usage_cache::{CacheManager, CacheSettings, RateLimiter};
//!
//! # async fn run() -> usage_cache::CacheResult<()> {
//! let settings = CacheSettings::from_env()?;
//! let cache = CacheManager::connect(settings).await?;
//!
//! let limiter = RateLimiter::new(cache.clone());
//! let admission = limiter.check_admission("client-42").await;
//! if !admission.allowed {
//!     // reject with 429, Retry-After = admission.reset_at
//! }
//! # Ok(())
//! # }
//! ```

mod aggregator;
mod config;
mod error;
mod keys;
mod local;
mod manager;
mod metrics;
mod rate_limit;
pub mod remote;
mod shard;
mod store;
mod swr;

pub use aggregator::{DailyUsageReport, TopClientsReport, UsageAggregator};
pub use config::CacheSettings;
pub use error::{CacheError, CacheResult};
pub use keys::{CacheKey, DAY_BUCKET_FORMAT, HOUR_BUCKET_FORMAT};
pub use local::LocalTier;
pub use manager::CacheManager;
pub use metrics::{CacheMetrics, Tier};
pub use rate_limit::{Admission, RateLimiter, BUCKET_TTL};
pub use remote::{MemoryRemote, RedisRemote, RemoteTier, RemoteValue};
pub use shard::{shard_for, ShardAssignment, ShardRouter};
pub use store::{
    Broadcaster, ClientUsage, DayCount, HitEvent, HubBroadcaster, MemoryUsageStore, Notification,
    UsageStore,
};
pub use swr::{Generational, RefreshPolicy};

pub use cache_invalidation::{InvalidationAction, InvalidationEvent, InvalidationRules};
