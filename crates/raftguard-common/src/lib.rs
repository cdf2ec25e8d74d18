//! raftguard Common - shared plumbing for the raftguard crates
//!
//! This crate provides:
//! - `Configuration`: typed access to the `raft-server.*`, `raft-snapshot.*`
//!   and `application.*` properties
//! - Raft / API address parsing
//! - TLS material loading and the relaxed-verification rustls configs used by
//!   the client pool and the peer stream layer

pub mod address;
pub mod config;
pub mod error;
pub mod tls;

// Re-exports for convenience
pub use address::{host_and_port, port_number};
pub use config::Configuration;
pub use error::{ConfigError, ConfigResult};
pub use tls::{TlsConfig, TlsMaterial};

/// Raft node identifier, matching the openraft type configuration used by callers
pub type NodeId = u64;
