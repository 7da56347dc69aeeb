//! Collaborator boundaries: the durable usage store and the notification
//! broadcaster. Only the shapes the aggregator needs live here.

use crate::error::{CacheError, CacheResult};
use cache_invalidation::FanoutHub;
use chrono::{DateTime, NaiveDate, Utc};
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// One recorded API hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitEvent {
    pub client_id: String,
    pub endpoint: String,
    pub ip_address: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientUsage {
    pub client_id: String,
    pub name: String,
    pub request_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayCount {
    pub date: NaiveDate,
    pub request_count: i64,
}

/// Durable store of usage data.
#[async_trait::async_trait]
pub trait UsageStore: Send + Sync {
    /// Append to the hit log; returns the hit id.
    async fn append_hit(&self, hit: &HitEvent) -> CacheResult<u64>;

    /// Per-day totals for `client_id` in `from..=to`. Days without hits may
    /// be omitted.
    async fn daily_counts(
        &self,
        client_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> CacheResult<Vec<DayCount>>;

    /// Clients with the most hits since `since`, busiest first.
    async fn top_clients(&self, since: DateTime<Utc>, limit: usize)
        -> CacheResult<Vec<ClientUsage>>;
}

/// Push message for connected dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: String,
    pub client_id: String,
    pub data: serde_json::Value,
    /// Unix seconds
    pub timestamp: i64,
}

impl Notification {
    pub fn usage_update(client_id: &str, data: serde_json::Value) -> Self {
        Self {
            kind: "usage_update".to_string(),
            client_id: client_id.to_string(),
            data,
            timestamp: Utc::now().timestamp(),
        }
    }
}

/// Best-effort delivery of notifications; no ordering guarantee.
#[async_trait::async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(&self, target: &str, notification: &Notification) -> CacheResult<()>;
}

/// [`Broadcaster`] over an in-process fan-out hub. Each target maps to its
/// own hub channel.
#[derive(Clone)]
pub struct HubBroadcaster {
    hub: FanoutHub,
    channel_prefix: String,
}

impl HubBroadcaster {
    pub fn new(hub: FanoutHub) -> Self {
        Self {
            hub,
            channel_prefix: "notifications:".to_string(),
        }
    }

    fn channel(&self, target: &str) -> String {
        format!("{}{}", self.channel_prefix, target)
    }

    /// Serialized notifications for `target`.
    pub async fn subscribe(&self, target: &str) -> CacheResult<BoxStream<'static, String>> {
        Ok(self.hub.subscribe_stream(&self.channel(target)).await?)
    }
}

#[async_trait::async_trait]
impl Broadcaster for HubBroadcaster {
    async fn broadcast(&self, target: &str, notification: &Notification) -> CacheResult<()> {
        let payload = serde_json::to_string(notification)?;
        self.hub.publish(&self.channel(target), payload).await?;
        Ok(())
    }
}

/// In-process [`UsageStore`] for tests and single-node development.
#[derive(Default)]
pub struct MemoryUsageStore {
    hits: Mutex<Vec<HitEvent>>,
    names: Mutex<HashMap<String, String>>,
    next_id: AtomicU64,
    failing: AtomicBool,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_client(&self, client_id: &str, name: &str) {
        self.names
            .lock()
            .insert(client_id.to_string(), name.to_string());
    }

    /// While set, every call fails with [`CacheError::Store`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn hit_count(&self) -> usize {
        self.hits.lock().len()
    }

    fn check(&self) -> CacheResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::Store("usage store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl UsageStore for MemoryUsageStore {
    async fn append_hit(&self, hit: &HitEvent) -> CacheResult<u64> {
        self.check()?;
        self.hits.lock().push(hit.clone());
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn daily_counts(
        &self,
        client_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> CacheResult<Vec<DayCount>> {
        self.check()?;
        let mut per_day: BTreeMap<NaiveDate, i64> = BTreeMap::new();
        for hit in self.hits.lock().iter() {
            let day = hit.timestamp.date_naive();
            if hit.client_id == client_id && day >= from && day <= to {
                *per_day.entry(day).or_default() += 1;
            }
        }
        Ok(per_day
            .into_iter()
            .map(|(date, request_count)| DayCount {
                date,
                request_count,
            })
            .collect())
    }

    async fn top_clients(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> CacheResult<Vec<ClientUsage>> {
        self.check()?;
        let mut counts: HashMap<String, i64> = HashMap::new();
        for hit in self.hits.lock().iter().filter(|h| h.timestamp >= since) {
            *counts.entry(hit.client_id.clone()).or_default() += 1;
        }

        let names = self.names.lock();
        let mut top: Vec<ClientUsage> = counts
            .into_iter()
            .map(|(client_id, request_count)| ClientUsage {
                name: names.get(&client_id).cloned().unwrap_or_default(),
                client_id,
                request_count,
            })
            .collect();
        top.sort_by(|a, b| {
            b.request_count
                .cmp(&a.request_count)
                .then_with(|| a.client_id.cmp(&b.client_id))
        });
        top.truncate(limit);
        Ok(top)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_invalidation::HubConfig;
    use chrono::Duration as ChronoDuration;
    use futures_util::StreamExt;

    fn hit(client: &str, at: DateTime<Utc>) -> HitEvent {
        HitEvent {
            client_id: client.to_string(),
            endpoint: "/api/v1/thing".to_string(),
            ip_address: "10.0.0.1".to_string(),
            timestamp: at,
        }
    }

    #[tokio::test]
    async fn test_memory_store_top_clients() {
        let store = MemoryUsageStore::new();
        store.register_client("a", "Alpha");
        let now = Utc::now();
        for _ in 0..3 {
            store.append_hit(&hit("a", now)).await.unwrap();
        }
        store.append_hit(&hit("b", now)).await.unwrap();
        store
            .append_hit(&hit("c", now - ChronoDuration::hours(30)))
            .await
            .unwrap();

        let top = store
            .top_clients(now - ChronoDuration::hours(24), 3)
            .await
            .unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].client_id, "a");
        assert_eq!(top[0].name, "Alpha");
        assert_eq!(top[0].request_count, 3);
    }

    #[tokio::test]
    async fn test_memory_store_failure_injection() {
        let store = MemoryUsageStore::new();
        store.set_failing(true);
        let err = store.append_hit(&hit("a", Utc::now())).await.unwrap_err();
        assert!(matches!(err, CacheError::Store(_)));
        assert_eq!(store.hit_count(), 0);
    }

    #[tokio::test]
    async fn test_hub_broadcaster_delivers_to_target() {
        let broadcaster = HubBroadcaster::new(FanoutHub::spawn(HubConfig::default()));
        let mut stream = broadcaster.subscribe("c1").await.unwrap();

        let note = Notification::usage_update("c1", serde_json::json!({"hit_id": 1}));
        broadcaster.broadcast("c1", &note).await.unwrap();
        broadcaster.broadcast("c2", &note).await.unwrap();

        let raw = stream.next().await.unwrap();
        let decoded: Notification = serde_json::from_str(&raw).unwrap();
        assert_eq!(decoded.kind, "usage_update");
        assert_eq!(decoded.client_id, "c1");
        assert!(raw.contains("\"type\":\"usage_update\""));
    }
}
