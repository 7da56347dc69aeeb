//! Usage aggregates served from cache
//!
//! `top_clients` is a global aggregate kept fresh with stale-while-revalidate.
//! `daily_usage` is a per-client read-through entry dropped by invalidation.
//! `record_hit` is the write path that makes both change.

use crate::error::CacheResult;
use crate::keys::CacheKey;
use crate::manager::CacheManager;
use crate::store::{Broadcaster, ClientUsage, DayCount, HitEvent, Notification, UsageStore};
use crate::swr::Generational;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Daily counters outlive the longest report window
const DAILY_COUNTER_TTL: Duration = Duration::from_secs(8 * 24 * 3600);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopClientsReport {
    pub period: String,
    pub generated_at: DateTime<Utc>,
    pub top_clients: Vec<ClientUsage>,
    pub total_clients: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyUsageReport {
    pub client_id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// One entry per day, oldest first, zero-filled
    pub usage: Vec<DayCount>,
}

#[derive(Clone)]
pub struct UsageAggregator {
    cache: CacheManager,
    store: Arc<dyn UsageStore>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
}

impl UsageAggregator {
    pub fn new(cache: CacheManager, store: Arc<dyn UsageStore>) -> Self {
        Self {
            cache,
            store,
            broadcaster: None,
        }
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    fn window(&self) -> ChronoDuration {
        ChronoDuration::hours(self.cache.settings().top_clients_window_hours)
    }

    fn period_label(&self) -> String {
        format!("last_{}_hours", self.cache.settings().top_clients_window_hours)
    }

    fn report(&self, generational: Generational<Vec<ClientUsage>>) -> TopClientsReport {
        TopClientsReport {
            period: self.period_label(),
            generated_at: generational.generated_at,
            total_clients: generational.value.len(),
            top_clients: generational.value,
        }
    }

    /// Busiest clients over the trailing window.
    ///
    /// Fresh entries are returned as is; stale ones are returned while one
    /// background recomputation runs; a miss waits for the recomputation and
    /// returns its error if the store fails.
    pub async fn top_clients(&self) -> CacheResult<TopClientsReport> {
        let store = Arc::clone(&self.store);
        let window = self.window();
        let limit = self.cache.settings().top_clients_limit;

        let generational = self
            .cache
            .get_or_refresh(&CacheKey::top_clients(), move || {
                let store = Arc::clone(&store);
                async move { store.top_clients(Utc::now() - window, limit).await }
            })
            .await?;

        Ok(self.report(generational))
    }

    /// Recompute the top-clients aggregate now and store it. A store failure
    /// leaves the cached entry untouched.
    pub async fn refresh_top_clients(&self) -> CacheResult<TopClientsReport> {
        let key = CacheKey::top_clients();
        let limit = self.cache.settings().top_clients_limit;

        let top = match self.store.top_clients(Utc::now() - self.window(), limit).await {
            Ok(top) => top,
            Err(e) => {
                warn!(key = %key, error = %e, "Top clients recomputation failed");
                return Err(e);
            }
        };

        let fresh = Generational::new(top);
        if let Err(e) = self.cache.set(&key, &fresh, self.cache.settings().cache_ttl()).await {
            warn!(key = %key, error = %e, "Failed to store top clients");
        }
        Ok(self.report(fresh))
    }

    /// Populate the top-clients aggregate ahead of the first request.
    pub async fn warm(&self) -> CacheResult<()> {
        let report = self.refresh_top_clients().await?;
        info!(clients = report.total_clients, "Usage cache warmed");
        Ok(())
    }

    /// Zero-filled per-day usage of `client_id` for the configured number of
    /// days ending today.
    pub async fn daily_usage(&self, client_id: &str) -> CacheResult<DailyUsageReport> {
        self.daily_usage_at(client_id, Utc::now().date_naive()).await
    }

    pub async fn daily_usage_at(
        &self,
        client_id: &str,
        today: NaiveDate,
    ) -> CacheResult<DailyUsageReport> {
        let key = CacheKey::daily_usage(client_id);

        match self.cache.get::<DailyUsageReport>(&key).await {
            Ok(Some(report)) => return Ok(report),
            Ok(None) => {}
            Err(e) => debug!(key = %key, error = %e, "Recomputing unreadable daily usage"),
        }

        let days = self.cache.settings().daily_usage_days;
        let start = today - ChronoDuration::days(days - 1);
        let counts = self.store.daily_counts(client_id, start, today).await?;
        let report = fill_missing_days(client_id, start, today, counts);

        if let Err(e) = self
            .cache
            .set(&key, &report, self.cache.settings().cache_ttl())
            .await
        {
            warn!(key = %key, error = %e, "Failed to cache daily usage");
        }
        Ok(report)
    }

    /// Record one hit: durable write, counters, invalidation, notification.
    ///
    /// Only the durable write can fail the call; cache and notification
    /// failures are logged.
    pub async fn record_hit(
        &self,
        client_id: &str,
        endpoint: &str,
        ip_address: &str,
    ) -> CacheResult<u64> {
        let hit = HitEvent {
            client_id: client_id.to_string(),
            endpoint: endpoint.to_string(),
            ip_address: ip_address.to_string(),
            timestamp: Utc::now(),
        };
        let hit_id = self.store.append_hit(&hit).await?;

        let daily_key = CacheKey::daily_counter(client_id, hit.timestamp.date_naive());
        match self.cache.increment(&daily_key, 1).await {
            Ok(1) => {
                if let Err(e) = self.cache.expire(&daily_key, DAILY_COUNTER_TTL).await {
                    warn!(key = %daily_key, error = %e, "Failed to set daily counter TTL");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(key = %daily_key, error = %e, "Failed to bump daily counter"),
        }

        let total_key = CacheKey::total_counter(client_id);
        if let Err(e) = self.cache.increment(&total_key, 1).await {
            warn!(key = %total_key, error = %e, "Failed to bump total counter");
        }

        if let Err(e) = self.cache.publish_invalidation(client_id).await {
            warn!(client_id = %client_id, error = %e, "Failed to publish invalidation");
        }

        if let Some(broadcaster) = &self.broadcaster {
            let notification = Notification::usage_update(
                client_id,
                serde_json::json!({ "hit_id": hit_id, "endpoint": endpoint }),
            );
            if let Err(e) = broadcaster.broadcast(client_id, &notification).await {
                warn!(client_id = %client_id, error = %e, "Failed to broadcast usage update");
            }
        }

        debug!(client_id = %client_id, hit_id, "Recorded hit");
        Ok(hit_id)
    }
}

fn fill_missing_days(
    client_id: &str,
    start: NaiveDate,
    end: NaiveDate,
    counts: Vec<DayCount>,
) -> DailyUsageReport {
    let by_day: HashMap<NaiveDate, i64> = counts
        .into_iter()
        .map(|c| (c.date, c.request_count))
        .collect();

    let usage = start
        .iter_days()
        .take_while(|day| *day <= end)
        .map(|date| DayCount {
            date,
            request_count: by_day.get(&date).copied().unwrap_or(0),
        })
        .collect();

    DailyUsageReport {
        client_id: client_id.to_string(),
        start_date: start,
        end_date: end,
        usage,
    }
}
