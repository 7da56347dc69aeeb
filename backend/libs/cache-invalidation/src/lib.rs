//! Cross-process cache invalidation over a pub/sub channel
//!
//! Every process subscribes to one channel. A writer publishes an
//! [`InvalidationEvent`] after the durable write; every subscriber, the
//! publisher included, maps the event to a set of derived cache keys through
//! [`InvalidationRules`] and drops them.
//!
//! ```text
//! Process A:
//!   1. Record hit for client 42 in the durable store
//!   2. PUBLISH usage_updates {"action":"usage_updated","client_id":"42","timestamp":...}
//!      ↓
//! Pub/Sub (broadcast to all subscribers, at-least-once)
//!      ↓
//! Process A, B, C:
//!   3. rules.keys_for(event) → usage:daily:42, usage:top:last24h, client:42
//!   4. delete each key from the local and shared tier (idempotent)
//! ```
//!
//! The transport is not part of this crate: [`spawn_listener`] consumes any
//! stream of raw payloads, and [`FanoutHub`] provides an in-process
//! publish/subscribe actor for single-node deployments and tests.
//!
//! # Example
//!
//! ```
//! use cache_invalidation::{InvalidationEvent, InvalidationRules};
//!
//! let rules = InvalidationRules::default();
//! let event = InvalidationEvent::usage_updated("42");
//! let keys = rules.keys_for(&event);
//! assert!(keys.contains(&"usage:daily:42".to_string()));
//! ```

use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

mod error;
pub mod helpers;
mod hub;
mod rules;
mod stats;

pub use error::InvalidationError;
pub use helpers::{render_key_template, validate_key_template, SUBJECT_PLACEHOLDER};
pub use hub::{receiver_stream, FanoutHub, HubConfig};
pub use rules::InvalidationRules;
pub use stats::{InvalidationStats, StatsCollector};

pub type Result<T> = std::result::Result<T, InvalidationError>;

/// Default pub/sub channel carrying invalidation events.
pub const DEFAULT_CHANNEL: &str = "usage_updates";

/// What happened to the subject.
///
/// Serialized as a bare string so producers written against the plain JSON
/// wire format (`"action": "usage_updated"`) interoperate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InvalidationAction {
    /// New usage was recorded for the subject
    UsageUpdated,
    /// The subject's client record changed
    ClientUpdated,
    Custom(String),
}

impl InvalidationAction {
    pub fn as_str(&self) -> &str {
        match self {
            InvalidationAction::UsageUpdated => "usage_updated",
            InvalidationAction::ClientUpdated => "client_updated",
            InvalidationAction::Custom(s) => s,
        }
    }
}

impl std::fmt::Display for InvalidationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for InvalidationAction {
    fn from(s: &str) -> Self {
        match s {
            "usage_updated" => InvalidationAction::UsageUpdated,
            "client_updated" => InvalidationAction::ClientUpdated,
            custom => InvalidationAction::Custom(custom.to_string()),
        }
    }
}

impl From<String> for InvalidationAction {
    fn from(s: String) -> Self {
        InvalidationAction::from(s.as_str())
    }
}

impl From<InvalidationAction> for String {
    fn from(action: InvalidationAction) -> Self {
        action.as_str().to_string()
    }
}

/// Invalidation event as it travels on the channel. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub action: InvalidationAction,
    #[serde(rename = "client_id")]
    pub subject_id: String,
    /// Unix seconds at publish time
    pub timestamp: i64,
}

impl InvalidationEvent {
    pub fn new(action: InvalidationAction, subject_id: impl Into<String>) -> Self {
        Self {
            action,
            subject_id: subject_id.into(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn usage_updated(subject_id: impl Into<String>) -> Self {
        Self::new(InvalidationAction::UsageUpdated, subject_id)
    }

    pub fn to_payload(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_payload(payload: &str) -> Result<Self> {
        let event: InvalidationEvent = serde_json::from_str(payload)?;
        if event.subject_id.is_empty() {
            return Err(InvalidationError::InvalidEvent(
                "event has an empty subject".to_string(),
            ));
        }
        Ok(event)
    }

    /// Milliseconds between publish time and now, clamped at zero.
    pub fn age_ms(&self) -> f64 {
        let now_ms = chrono::Utc::now().timestamp_millis();
        (now_ms - self.timestamp * 1000).max(0) as f64
    }
}

/// Consume raw payloads from `stream` and run `handler` for every decodable
/// event, one message at a time.
///
/// Undecodable payloads and handler failures are logged and counted; the
/// loop only ends when the stream does. The returned handle owns the task.
pub fn spawn_listener<S, F, Fut>(stream: S, stats: StatsCollector, handler: F) -> JoinHandle<()>
where
    S: Stream<Item = String> + Send + Unpin + 'static,
    F: Fn(InvalidationEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<usize>> + Send + 'static,
{
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        let mut stream = stream;

        while let Some(payload) = stream.next().await {
            let event = match InvalidationEvent::from_payload(&payload) {
                Ok(event) => event,
                Err(e) => {
                    stats.record_error();
                    error!(error = %e, payload = %payload, "Failed to decode invalidation event");
                    continue;
                }
            };

            stats.record_receive();
            stats.record_latency(event.age_ms());

            debug!(
                action = %event.action,
                subject = %event.subject_id,
                "Received invalidation event"
            );

            match handler(event.clone()).await {
                Ok(purged) => stats.record_keys_invalidated(purged as u64),
                Err(e) => {
                    stats.record_error();
                    error!(
                        error = %e,
                        action = %event.action,
                        subject = %event.subject_id,
                        "Invalidation handler failed"
                    );
                }
            }
        }

        warn!("Invalidation subscription ended");
    })
}
