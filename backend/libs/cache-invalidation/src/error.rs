//! Error types for cache invalidation operations

use thiserror::Error;

/// Cache invalidation errors
#[derive(Error, Debug)]
pub enum InvalidationError {
    /// Event serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Decoded event is structurally invalid
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Handler execution failed
    #[error("Handler execution failed: {0}")]
    HandlerFailed(String),

    /// The fan-out hub task is gone
    #[error("Fan-out hub closed")]
    HubClosed,

    /// Rule or hub configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}
