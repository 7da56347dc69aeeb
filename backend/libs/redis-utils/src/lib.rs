use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::{Client, ConnectionInfo, IntoConnectionInfo, RedisError};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::{debug, info};

/// Redis connection pool: a multiplexed command connection plus the client
/// used to open dedicated pub/sub connections.
#[derive(Clone)]
pub struct RedisPool {
    client: Client,
    manager: Arc<Mutex<ConnectionManager>>,
}

impl RedisPool {
    /// Connect and verify the server answers `PING` within `connect_timeout`.
    ///
    /// Accepts bare `host:port` addresses as well as `redis://` / `rediss://` URLs.
    pub async fn connect(redis_url: &str, connect_timeout: Duration) -> Result<Self> {
        let normalized = normalize_redis_url(redis_url);
        let info: ConnectionInfo = normalized
            .as_str()
            .into_connection_info()
            .context("failed to parse REDIS_URL connection string")?;

        let client = Client::open(info).context("failed to construct Redis client")?;

        let connection_manager = timeout(connect_timeout, ConnectionManager::new(client.clone()))
            .await
            .context("timed out initializing Redis connection manager")?
            .context("failed to initialize Redis connection manager")?;

        let pool = Self {
            client,
            manager: Arc::new(Mutex::new(connection_manager)),
        };

        let pong: String = run_with_timeout(connect_timeout, async {
            let mut conn = pool.connection().await;
            redis::cmd("PING").query_async(&mut conn).await
        })
        .await
        .context("Redis did not answer PING")?;

        info!(url = %normalized, reply = %pong, "Redis connection established");
        Ok(pool)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Clone a handle to the multiplexed connection.
    ///
    /// The mutex is held only for the clone, so concurrent callers pipeline
    /// over the same socket instead of queueing behind each other.
    pub async fn connection(&self) -> ConnectionManager {
        let guard = self.manager.lock().await;
        guard.clone()
    }
}

/// Run a Redis future, converting an elapsed `limit` into an IO-kind
/// `RedisError` so callers handle timeouts like any other connection failure.
pub async fn run_with_timeout<F, T>(limit: Duration, future: F) -> Result<T, RedisError>
where
    F: Future<Output = Result<T, RedisError>>,
{
    match timeout(limit, future).await {
        Ok(res) => res,
        Err(_) => {
            debug!(timeout_ms = limit.as_millis() as u64, "redis command timed out");
            Err(RedisError::from((
                redis::ErrorKind::IoError,
                "redis command timed out",
            )))
        }
    }
}

/// Prefix bare `host:port` addresses with `redis://`.
pub fn normalize_redis_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with("redis://")
        || trimmed.starts_with("rediss://")
        || trimmed.starts_with("redis+unix://")
        || trimmed.starts_with("unix://")
    {
        trimmed.to_string()
    } else {
        format!("redis://{}", trimmed)
    }
}
