// Error types for the peer stream layer

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use raftguard_common::ConfigError;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("local address '{0}' is not a TCP address")]
    NotTcp(String),

    #[error("local bind address {0} is not advertisable")]
    NotAdvertisable(SocketAddr),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("dial {address} timed out after {timeout:?}")]
    Timeout { address: String, timeout: Duration },

    #[error("stream layer is closed")]
    Closed,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;
