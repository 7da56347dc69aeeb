//! Cache error types

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    /// Invalid settings; fatal at startup
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Shared tier unreachable or failing; callers degrade to the local tier
    #[error("Remote cache unavailable: {0}")]
    RemoteUnavailable(String),

    /// Shared tier call exceeded the fixed remote timeout
    #[error("Remote cache call timed out after {0:?}")]
    Timeout(Duration),

    /// Shared tier reachable but rejected the command (e.g. INCRBY on a
    /// non-integer value)
    #[error("Remote cache rejected command: {0}")]
    RemoteCommand(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Durable store failure while computing an aggregate
    #[error("Store error: {0}")]
    Store(String),
}

impl CacheError {
    /// Failures that switch the manager to local-only mode.
    pub fn is_remote_failure(&self) -> bool {
        matches!(self, CacheError::RemoteUnavailable(_) | CacheError::Timeout(_))
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_timeout()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
        {
            CacheError::RemoteUnavailable(err.to_string())
        } else {
            CacheError::RemoteCommand(err.to_string())
        }
    }
}

impl From<cache_invalidation::InvalidationError> for CacheError {
    fn from(err: cache_invalidation::InvalidationError) -> Self {
        use cache_invalidation::InvalidationError;
        match err {
            InvalidationError::Serialization(e) => CacheError::Serialization(e),
            InvalidationError::Configuration(msg) => CacheError::Configuration(msg),
            InvalidationError::HubClosed => {
                CacheError::RemoteUnavailable("fan-out hub closed".to_string())
            }
            other => CacheError::RemoteUnavailable(other.to_string()),
        }
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
