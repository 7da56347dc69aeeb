//! Cache subsystem settings
//!
//! Values arrive already parsed (from env via [`CacheSettings::from_env`] or
//! from the host service's own config loader through serde). Everything is
//! checked once by [`CacheSettings::validate`] at startup.

use crate::error::{CacheError, CacheResult};
use cache_invalidation::{InvalidationRules, DEFAULT_CHANNEL};
use serde::{Deserialize, Deserializer};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    /// Shared tier address; `None` runs local-only
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Absolute TTL of cached aggregates
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_rate_limit_per_hour")]
    pub rate_limit_per_hour: u32,
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,
    /// Fixed timeout applied to every shared-tier call
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,
    #[serde(default = "default_remote_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// TTL for local entries written without one (local increment fallback)
    #[serde(default = "default_local_ttl_secs")]
    pub local_default_ttl_secs: u64,
    /// Upper bound on the TTL of local copies filled from the shared tier
    #[serde(default = "default_backfill_ttl_secs")]
    pub backfill_ttl_secs: u64,
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
    /// Age after which a generational value is served stale and refreshed
    #[serde(default = "default_staleness_threshold_secs")]
    pub staleness_threshold_secs: u64,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_invalidation_channel")]
    pub invalidation_channel: String,
    #[serde(default = "default_top_clients_limit")]
    pub top_clients_limit: usize,
    #[serde(default = "default_top_clients_window_hours")]
    pub top_clients_window_hours: i64,
    #[serde(default = "default_daily_usage_days")]
    pub daily_usage_days: i64,
    /// Event action → derived key templates. Accepts a map or a JSON string
    /// (the latter for env-based configuration).
    #[serde(default, deserialize_with = "deserialize_rules")]
    pub invalidation_rules: InvalidationRules,
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_rate_limit_per_hour() -> u32 {
    1000
}

fn default_shard_count() -> u32 {
    4
}

fn default_remote_timeout_ms() -> u64 {
    5000
}

fn default_local_ttl_secs() -> u64 {
    300
}

fn default_backfill_ttl_secs() -> u64 {
    300
}

fn default_purge_interval_secs() -> u64 {
    600
}

fn default_staleness_threshold_secs() -> u64 {
    300
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_invalidation_channel() -> String {
    DEFAULT_CHANNEL.to_string()
}

fn default_top_clients_limit() -> usize {
    3
}

fn default_top_clients_window_hours() -> i64 {
    24
}

fn default_daily_usage_days() -> i64 {
    7
}

fn deserialize_rules<'de, D>(deserializer: D) -> Result<InvalidationRules, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RulesRepr {
        Json(String),
        Map(InvalidationRules),
    }

    match RulesRepr::deserialize(deserializer)? {
        RulesRepr::Json(raw) => serde_json::from_str(&raw).map_err(serde::de::Error::custom),
        RulesRepr::Map(rules) => Ok(rules),
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            redis_url: None,
            cache_ttl_secs: default_cache_ttl_secs(),
            rate_limit_per_hour: default_rate_limit_per_hour(),
            shard_count: default_shard_count(),
            remote_timeout_ms: default_remote_timeout_ms(),
            connect_timeout_ms: default_remote_timeout_ms(),
            local_default_ttl_secs: default_local_ttl_secs(),
            backfill_ttl_secs: default_backfill_ttl_secs(),
            purge_interval_secs: default_purge_interval_secs(),
            staleness_threshold_secs: default_staleness_threshold_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            invalidation_channel: default_invalidation_channel(),
            top_clients_limit: default_top_clients_limit(),
            top_clients_window_hours: default_top_clients_window_hours(),
            daily_usage_days: default_daily_usage_days(),
            invalidation_rules: InvalidationRules::default(),
        }
    }
}

impl CacheSettings {
    /// Load from `USAGE_CACHE_*` environment variables (and `.env` if present),
    /// then validate.
    pub fn from_env() -> CacheResult<Self> {
        dotenvy::dotenv().ok();

        let settings: CacheSettings = envy::prefixed("USAGE_CACHE_")
            .from_env()
            .map_err(|e| CacheError::Configuration(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.shard_count == 0 {
            return Err(CacheError::Configuration(
                "shard_count must be greater than zero".to_string(),
            ));
        }
        if self.cache_ttl_secs == 0 {
            return Err(CacheError::Configuration(
                "cache_ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.staleness_threshold_secs >= self.cache_ttl_secs {
            return Err(CacheError::Configuration(format!(
                "staleness_threshold_secs ({}) must be below cache_ttl_secs ({})",
                self.staleness_threshold_secs, self.cache_ttl_secs
            )));
        }
        if self.backfill_ttl_secs == 0 || self.backfill_ttl_secs > self.cache_ttl_secs {
            return Err(CacheError::Configuration(format!(
                "backfill_ttl_secs ({}) must be in 1..={}",
                self.backfill_ttl_secs, self.cache_ttl_secs
            )));
        }
        if self.remote_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(CacheError::Configuration(
                "remote timeouts must be greater than zero".to_string(),
            ));
        }
        if self.purge_interval_secs == 0 || self.health_check_interval_secs == 0 {
            return Err(CacheError::Configuration(
                "background intervals must be greater than zero".to_string(),
            ));
        }
        if self.invalidation_channel.is_empty() {
            return Err(CacheError::Configuration(
                "invalidation_channel must not be empty".to_string(),
            ));
        }
        if self.top_clients_limit == 0
            || self.top_clients_window_hours <= 0
            || self.daily_usage_days <= 0
        {
            return Err(CacheError::Configuration(
                "aggregate windows and limits must be positive".to_string(),
            ));
        }
        self.invalidation_rules.validate()?;
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn local_default_ttl(&self) -> Duration {
        Duration::from_secs(self.local_default_ttl_secs)
    }

    pub fn backfill_ttl(&self) -> Duration {
        Duration::from_secs(self.backfill_ttl_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.staleness_threshold_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_invalidation::InvalidationAction;

    #[test]
    fn test_defaults_are_valid() {
        let settings = CacheSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.cache_ttl(), Duration::from_secs(3600));
        assert_eq!(settings.rate_limit_per_hour, 1000);
        assert_eq!(settings.shard_count, 4);
        assert_eq!(settings.invalidation_channel, "usage_updates");
    }

    #[test]
    fn test_zero_shard_count_rejected() {
        let settings = CacheSettings {
            shard_count: 0,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(CacheError::Configuration(_))
        ));
    }

    #[test]
    fn test_staleness_must_be_below_ttl() {
        let settings = CacheSettings {
            cache_ttl_secs: 60,
            staleness_threshold_secs: 60,
            backfill_ttl_secs: 30,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_backfill_cannot_exceed_ttl() {
        let settings = CacheSettings {
            cache_ttl_secs: 60,
            staleness_threshold_secs: 10,
            backfill_ttl_secs: 120,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_with_defaults() {
        let json = r#"{"cache_ttl_secs": 120, "staleness_threshold_secs": 30, "backfill_ttl_secs": 60, "shard_count": 8}"#;
        let settings: CacheSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.shard_count, 8);
        assert_eq!(settings.remote_timeout_ms, 5000);
        assert_eq!(settings.invalidation_rules, InvalidationRules::default());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_rules_from_json_string() {
        let json = r#"{"invalidation_rules": "{\"usage_updated\":[\"usage:daily:{subject}\"]}"}"#;
        let settings: CacheSettings = serde_json::from_str(json).unwrap();
        assert_eq!(
            settings
                .invalidation_rules
                .templates(&InvalidationAction::UsageUpdated),
            &["usage:daily:{subject}".to_string()]
        );
    }

    #[test]
    fn test_rules_from_map() {
        let json = r#"{"invalidation_rules": {"client_updated": ["client:{subject}"]}}"#;
        let settings: CacheSettings = serde_json::from_str(json).unwrap();
        assert!(settings
            .invalidation_rules
            .has_rule(&InvalidationAction::ClientUpdated));
        assert!(!settings
            .invalidation_rules
            .has_rule(&InvalidationAction::UsageUpdated));
    }
}
