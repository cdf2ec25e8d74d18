// Error types for the API client pool

use thiserror::Error;

use raftguard_common::ConfigError;

/// Errors returned by the pool.
///
/// Cloneable because a failed dial is reported to every caller that was
/// waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("failed to connect to {endpoint}: {message}")]
    Connect { endpoint: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("client pool is closed")]
    Closed,
}

impl From<ConfigError> for PoolError {
    fn from(err: ConfigError) -> Self {
        PoolError::Config(err.to_string())
    }
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;
