use super::{RemoteTier, RemoteValue};
use crate::error::CacheResult;
use futures_util::stream::{BoxStream, StreamExt};
use redis::AsyncCommands;
use redis_utils::RedisPool;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Shared tier backed by Redis.
///
/// Commands go over the pool's multiplexed connection; each subscription
/// gets its own dedicated pub/sub connection.
#[derive(Clone)]
pub struct RedisRemote {
    pool: RedisPool,
}

impl RedisRemote {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    /// Connect to `redis_url`, failing if the server does not answer within
    /// `connect_timeout`.
    pub async fn connect(redis_url: &str, connect_timeout: Duration) -> anyhow::Result<Self> {
        let pool = RedisPool::connect(redis_url, connect_timeout).await?;
        Ok(Self::new(pool))
    }
}

/// Redis rejects `PX 0`; a zero TTL becomes the shortest allowed lifetime.
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait::async_trait]
impl RemoteTier for RedisRemote {
    async fn ping(&self) -> CacheResult<()> {
        let mut conn = self.pool.connection().await;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> CacheResult<Option<RemoteValue>> {
        let mut conn = self.pool.connection().await;
        let (payload, pttl): (Option<String>, i64) = redis::pipe()
            .cmd("GET")
            .arg(key)
            .cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await?;

        Ok(payload.map(|payload| {
            // PTTL: -1 no expiry, -2 key vanished between the two commands
            let ttl = (pttl >= 0).then(|| Duration::from_millis(pttl as u64));
            debug!(key = %key, ttl_ms = pttl, "Redis cache hit");
            RemoteValue { payload, ttl }
        }))
    }

    async fn set(&self, key: &str, payload: &str, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.pool.connection().await;
        redis::cmd("SET")
            .arg(key)
            .arg(payload)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.pool.connection().await;
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> CacheResult<i64> {
        let mut conn = self.pool.connection().await;
        let value: i64 = conn.incr(key, delta).await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        let mut conn = self.pool.connection().await;
        let applied: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn publish(&self, channel: &str, payload: &str) -> CacheResult<usize> {
        let mut conn = self.pool.connection().await;
        let receivers: i64 = conn.publish(channel, payload).await?;
        Ok(receivers.max(0) as usize)
    }

    async fn subscribe(&self, channel: &str) -> CacheResult<BoxStream<'static, String>> {
        let mut pubsub = self.pool.client().get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        info!(channel = %channel, "Subscribed to Redis channel");

        let channel = channel.to_string();
        let stream = pubsub
            .into_on_message()
            .filter_map(move |msg| {
                let payload = match msg.get_payload::<String>() {
                    Ok(p) => Some(p),
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Dropping non-text pub/sub payload");
                        None
                    }
                };
                futures_util::future::ready(payload)
            })
            .boxed();

        Ok(stream)
    }
}
