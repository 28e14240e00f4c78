//! Error types for resilient fetches

use std::time::Duration;

use thiserror::Error;

/// Result type alias for caller-facing operations
pub type Result<T> = std::result::Result<T, ResilienceError>;

/// Failure raised by a fetch collaborator.
///
/// These never cross the public read API: the retry executor absorbs them and
/// the cache converts exhaustion into a cached `None`.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection, DNS or other transport-level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Upstream answered with a non-success status
    #[error("upstream returned status {code}")]
    Status { code: u16 },

    /// Upstream payload could not be decoded
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Failure injected by a [`FaultInjector`](crate::fetch::FaultInjector)
    #[error("injected upstream failure")]
    Injected,

    /// The fetch observed its cancellation token and gave up
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport(_) => true,
            FetchError::Status { code } => *code >= 500 || *code == 404 || *code == 429,
            FetchError::Injected => true,
            FetchError::Decode(_) => false,
            FetchError::Cancelled => false,
        }
    }
}

/// Error surfaced to callers of the resilient read API
#[derive(Debug, Error)]
pub enum ResilienceError {
    /// The caller's deadline elapsed before a result was available
    #[error("operation `{operation}` timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Retries were exhausted (possibly in an earlier, cached episode)
    #[error("operation `{operation}` is unavailable")]
    Unavailable { operation: String },

    /// The worker task panicked or was aborted
    #[error("worker failed: {0}")]
    WorkerFailed(String),

    /// Malformed configuration, rejected at construction time
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Configuration file could not be read
    #[error("config IO error: {0}")]
    ConfigIo(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl ResilienceError {
    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        ResilienceError::InvalidConfig {
            message: message.into(),
        }
    }

    /// True for hard timeouts, as opposed to soft unavailability.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ResilienceError::Timeout { .. })
    }

    /// True when the upstream was reached but no value could be produced.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ResilienceError::Unavailable { .. })
    }
}
