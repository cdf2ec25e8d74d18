//! Connection pool for the API servers of Raft peers
//!
//! Peers are addressed by their Raft address; the pool derives the API
//! endpoint from it, dials once per peer and keeps the connection while the
//! peer's gRPC health watch stays open.

pub mod connector;
pub mod error;
pub mod health;
pub mod pool;

pub use connector::{ApiConnector, GrpcConnector, HealthStream};
pub use error::{PoolError, PoolResult};
pub use health::HealthStatus;
pub use pool::{ApiClientPool, PoolConfig, PooledClient};

use std::sync::Arc;

use raftguard_common::Configuration;

/// Build the gRPC pool described by the configuration
pub fn grpc_pool(config: &Configuration) -> PoolResult<Arc<ApiClientPool<GrpcConnector>>> {
    let connector = GrpcConnector::from_configuration(config)?;
    let pool_config = PoolConfig::from_configuration(config)?;
    Ok(ApiClientPool::new(connector, pool_config))
}
