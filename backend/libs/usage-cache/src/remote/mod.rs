//! Shared cache tier
//!
//! The manager talks to the shared tier only through [`RemoteTier`]. Every
//! call it makes is wrapped in the configured remote timeout, so
//! implementations do not need their own.

use crate::error::CacheResult;
use futures_util::stream::BoxStream;
use std::time::Duration;

mod memory;
mod redis_tier;

pub use memory::MemoryRemote;
pub use redis_tier::RedisRemote;

/// Payload read from the shared tier with its remaining lifetime
/// (`None` when the key has no expiry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteValue {
    pub payload: String,
    pub ttl: Option<Duration>,
}

#[async_trait::async_trait]
pub trait RemoteTier: Send + Sync {
    /// Round-trip liveness check
    async fn ping(&self) -> CacheResult<()>;

    async fn get(&self, key: &str) -> CacheResult<Option<RemoteValue>>;

    async fn set(&self, key: &str, payload: &str, ttl: Duration) -> CacheResult<()>;

    /// Delete `key`; absent keys are not an error. Returns whether it existed.
    async fn del(&self, key: &str) -> CacheResult<bool>;

    /// Atomically add `delta` and return the new value. A missing key counts
    /// as zero and is created without an expiry.
    async fn incr_by(&self, key: &str, delta: i64) -> CacheResult<i64>;

    /// Set the lifetime of an existing key. Returns false when absent.
    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool>;

    /// Returns the number of subscribers that received the message.
    async fn publish(&self, channel: &str, payload: &str) -> CacheResult<usize>;

    /// Open a subscription; the stream ends when the connection is lost.
    async fn subscribe(&self, channel: &str) -> CacheResult<BoxStream<'static, String>>;
}
