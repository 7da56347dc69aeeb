use super::{RemoteTier, RemoteValue};
use crate::error::{CacheError, CacheResult};
use cache_invalidation::{FanoutHub, HubConfig};
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct StoredValue {
    payload: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

struct MemoryState {
    values: Mutex<HashMap<String, StoredValue>>,
    hub: FanoutHub,
    reachable: AtomicBool,
    latency_ms: AtomicU64,
}

/// In-process shared tier.
///
/// Clones share the same store, so several managers holding clones of one
/// `MemoryRemote` behave like several processes sharing one Redis. Pub/sub
/// goes through a [`FanoutHub`]. Reachability and per-call latency can be
/// changed at runtime for fault injection.
#[derive(Clone)]
pub struct MemoryRemote {
    state: Arc<MemoryState>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    /// Must be called inside a Tokio runtime (spawns the fan-out actor).
    pub fn new() -> Self {
        Self::with_hub_config(HubConfig::default())
    }

    pub fn with_hub_config(config: HubConfig) -> Self {
        Self {
            state: Arc::new(MemoryState {
                values: Mutex::new(HashMap::new()),
                hub: FanoutHub::spawn(config),
                reachable: AtomicBool::new(true),
                latency_ms: AtomicU64::new(0),
            }),
        }
    }

    /// While unreachable every call fails with `RemoteUnavailable`.
    /// Open subscriptions stay open.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.state.reachable.load(Ordering::SeqCst)
    }

    /// Delay added before every call.
    pub fn set_latency(&self, latency: Duration) {
        self.state
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Raw read that bypasses reachability, for assertions.
    pub fn peek(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.state
            .values
            .lock()
            .get(key)
            .filter(|v| v.is_live(now))
            .map(|v| v.payload.clone())
    }

    async fn enter(&self) -> CacheResult<()> {
        let latency = self.state.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.is_reachable() {
            return Err(CacheError::RemoteUnavailable(
                "memory remote is unreachable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RemoteTier for MemoryRemote {
    async fn ping(&self) -> CacheResult<()> {
        self.enter().await
    }

    async fn get(&self, key: &str) -> CacheResult<Option<RemoteValue>> {
        self.enter().await?;
        let now = Instant::now();
        let mut values = self.state.values.lock();

        let found = values.get(key).map(|v| {
            (
                v.is_live(now),
                RemoteValue {
                    payload: v.payload.clone(),
                    ttl: v.expires_at.map(|at| at.saturating_duration_since(now)),
                },
            )
        });
        match found {
            Some((true, value)) => Ok(Some(value)),
            Some((false, _)) => {
                values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, payload: &str, ttl: Duration) -> CacheResult<()> {
        self.enter().await?;
        self.state.values.lock().insert(
            key.to_string(),
            StoredValue {
                payload: payload.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> CacheResult<bool> {
        self.enter().await?;
        let now = Instant::now();
        let removed = self.state.values.lock().remove(key);
        Ok(removed.is_some_and(|v| v.is_live(now)))
    }

    async fn incr_by(&self, key: &str, delta: i64) -> CacheResult<i64> {
        self.enter().await?;
        let now = Instant::now();
        // Read and write under one lock acquisition
        let mut values = self.state.values.lock();

        let (current, expires_at) = match values.get(key) {
            Some(v) if v.is_live(now) => {
                let current = v.payload.parse::<i64>().map_err(|_| {
                    CacheError::RemoteCommand(
                        "value is not an integer or out of range".to_string(),
                    )
                })?;
                (current, v.expires_at)
            }
            _ => (0, None),
        };

        let next = current.checked_add(delta).ok_or_else(|| {
            CacheError::RemoteCommand("increment or decrement would overflow".to_string())
        })?;
        values.insert(
            key.to_string(),
            StoredValue {
                payload: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        self.enter().await?;
        let now = Instant::now();
        let mut values = self.state.values.lock();
        match values.get_mut(key) {
            Some(v) if v.is_live(now) => {
                v.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> CacheResult<usize> {
        self.enter().await?;
        Ok(self.state.hub.publish(channel, payload.to_string()).await?)
    }

    async fn subscribe(&self, channel: &str) -> CacheResult<BoxStream<'static, String>> {
        self.enter().await?;
        Ok(self.state.hub.subscribe_stream(channel).await?)
    }
}
