//! Muninn error types

use std::time::Duration;

/// Muninn error types
#[derive(Debug, thiserror::Error)]
pub enum MuninnError {
    // Backing store errors
    /// The cache backend could not be reached. Callers above the store never
    /// see this: the store degrades to a transparent no-op instead.
    #[error("cache backend unavailable: {0}")]
    ConnectionUnavailable(String),

    // Data errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Fetch errors
    #[error("fetch failed for {key}: {message}")]
    Fetch { key: String, message: String },

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    // Configuration errors
    #[error("no fetcher registered for '{0}'")]
    UnknownFetcher(String),

    #[error("warming schedule not found: {0}")]
    ScheduleNotFound(String),

    #[error("invalid service type: {0}")]
    InvalidServiceType(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl MuninnError {
    /// Build a [`MuninnError::Fetch`] from any displayable error.
    pub fn fetch(key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        MuninnError::Fetch {
            key: key.into(),
            message: err.to_string(),
        }
    }

    /// Whether this error means the backing store is unreachable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, MuninnError::ConnectionUnavailable(_))
    }
}

/// Result type alias for Muninn operations
pub type Result<T> = std::result::Result<T, MuninnError>;
