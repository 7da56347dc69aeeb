//! Statistics tracking for cache invalidation operations

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Statistics for invalidation operations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvalidationStats {
    pub messages_published: u64,
    pub messages_received: u64,
    pub keys_invalidated: u64,
    pub errors: u64,
    /// Publish-to-receive delay
    pub latency_p50_ms: f64,
    pub latency_p99_ms: f64,
}

const MAX_LATENCY_SAMPLES: usize = 1000;

/// Thread-safe statistics collector
#[derive(Clone, Default)]
pub struct StatsCollector {
    messages_published: Arc<AtomicU64>,
    messages_received: Arc<AtomicU64>,
    keys_invalidated: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
    latencies: Arc<parking_lot::Mutex<Vec<f64>>>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_publish(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_receive(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_keys_invalidated(&self, count: u64) {
        self.keys_invalidated.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record latency (in milliseconds)
    pub fn record_latency(&self, latency_ms: f64) {
        let mut latencies = self.latencies.lock();
        latencies.push(latency_ms);
        // Keep the newest half once the window fills up
        if latencies.len() > MAX_LATENCY_SAMPLES {
            latencies.drain(0..MAX_LATENCY_SAMPLES / 2);
        }
    }

    /// Get current statistics snapshot
    pub fn snapshot(&self) -> InvalidationStats {
        let (p50, p99) = {
            let mut latencies = self.latencies.lock().clone();
            if latencies.is_empty() {
                (0.0, 0.0)
            } else {
                latencies.sort_by(f64::total_cmp);
                let last = latencies.len() - 1;
                let p50_idx = ((latencies.len() as f64 * 0.50) as usize).min(last);
                let p99_idx = ((latencies.len() as f64 * 0.99) as usize).min(last);
                (latencies[p50_idx], latencies[p99_idx])
            }
        };

        InvalidationStats {
            messages_published: self.messages_published.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            keys_invalidated: self.keys_invalidated.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            latency_p50_ms: p50,
            latency_p99_ms: p99,
        }
    }

    pub fn reset(&self) {
        self.messages_published.store(0, Ordering::Relaxed);
        self.messages_received.store(0, Ordering::Relaxed);
        self.keys_invalidated.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.latencies.lock().clear();
    }
}
