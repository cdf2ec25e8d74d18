// Background health tracking for pooled API connections
// One Check, then a Watch stream until the peer goes away

use std::fmt;
use std::sync::{Arc, Weak};

use futures::StreamExt;
use tonic::Code;
use tonic_health::pb::health_check_response::ServingStatus;
use tracing::{debug, info, warn};

use crate::connector::ApiConnector;
use crate::pool::{ApiClientPool, PooledClient};

/// Last observed health of a pooled peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HealthStatus {
    #[default]
    Unknown,
    Serving,
    NotServing,
    /// The peer does not implement the health service
    Unimplemented,
}

impl HealthStatus {
    /// Map a `grpc.health.v1` serving status
    pub fn from_wire(status: i32) -> Self {
        match ServingStatus::try_from(status) {
            Ok(ServingStatus::Serving) => HealthStatus::Serving,
            Ok(ServingStatus::NotServing) => HealthStatus::NotServing,
            _ => HealthStatus::Unknown,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Unknown => "UNKNOWN",
            HealthStatus::Serving => "SERVING",
            HealthStatus::NotServing => "NOT_SERVING",
            HealthStatus::Unimplemented => "UNIMPLEMENTED",
        };
        f.write_str(s)
    }
}

/// Track the health of `client` until its watch stream ends, then drop the
/// client from the pool if the pool still maps its address to it.
pub(crate) async fn track_health<C: ApiConnector>(
    connector: Arc<C>,
    client: Arc<PooledClient<C::Connection>>,
    service: String,
    pool: Weak<ApiClientPool<C>>,
) {
    match connector.check(client.connection(), &service).await {
        Ok(status) => {
            client.set_status(status);
            info!(
                "Health of {} (raft {}) is {}",
                client.endpoint(),
                client.address(),
                status
            );
        }
        Err(e) if e.code() == Code::Unimplemented => {
            client.set_status(HealthStatus::Unimplemented);
            info!(
                "Health check not implemented by {} (raft {})",
                client.endpoint(),
                client.address()
            );
            return;
        }
        Err(e) => {
            warn!(
                "Health check of {} (raft {}) failed: {}",
                client.endpoint(),
                client.address(),
                e
            );
            return;
        }
    }

    let mut updates = match connector.watch(client.connection(), &service).await {
        Ok(updates) => updates,
        Err(e) => {
            warn!(
                "Health watch of {} (raft {}) failed: {}",
                client.endpoint(),
                client.address(),
                e
            );
            return;
        }
    };

    while let Some(update) = updates.next().await {
        match update {
            Ok(status) => {
                let previous = client.set_status(status);
                if previous != status {
                    info!(
                        "Health of {} (raft {}) changed {} -> {}",
                        client.endpoint(),
                        client.address(),
                        previous,
                        status
                    );
                }
            }
            Err(e) => {
                warn!(
                    "Health watch of {} (raft {}) ended with error: {}",
                    client.endpoint(),
                    client.address(),
                    e
                );
                break;
            }
        }
    }

    debug!("Health watch of {} closed", client.endpoint());
    if let Some(pool) = pool.upgrade() {
        pool.remove_client(client.address(), &client);
    }
}
