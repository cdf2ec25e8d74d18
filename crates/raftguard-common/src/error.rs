//! Configuration error types

use thiserror::Error;

/// Errors raised while resolving configuration or TLS material.
///
/// These are wiring-time failures: they surface to the operator before any
/// component is built on top of the bad value.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("empty property '{0}'")]
    MissingProperty(String),

    #[error("invalid property '{key}': {message}")]
    InvalidProperty { key: String, message: String },

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("tls material error: {0}")]
    Tls(String),

    #[error("configuration source error: {0}")]
    Source(#[from] config::ConfigError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;
