// API client connection pool
// Maps Raft peer addresses to connections on the peer's API endpoint, which
// listens at a fixed port offset from the Raft port

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use raftguard_common::config::RAFT_SERVICE_NAME;
use raftguard_common::{Configuration, host_and_port, port_number};

use crate::connector::ApiConnector;
use crate::error::{PoolError, PoolResult};
use crate::health::{HealthStatus, track_health};

/// Pool settings
#[derive(Clone, Debug, Default)]
pub struct PoolConfig {
    /// API port minus Raft port
    pub port_offset: i32,
    /// gRPC health service to track; `None` disables health tracking
    pub service_name: Option<String>,
}

impl PoolConfig {
    /// Derive the pool settings from application configuration.
    ///
    /// The port offset is the difference between the API listen port and the
    /// Raft listen port when both are configured, otherwise zero.
    pub fn from_configuration(config: &Configuration) -> PoolResult<Self> {
        let service_name = config.raft_service_name();
        if service_name.is_none() {
            warn!(
                "property '{}' is empty, health check would be disabled",
                RAFT_SERVICE_NAME
            );
        }

        let raft_address = config.raft_listen_address();
        let api_address = match raft_address {
            Some(_) => config.api_listen_address()?,
            None => None,
        };

        let port_offset = match (raft_address, api_address) {
            (Some(raft_address), Some(api_address)) => {
                let raft_port = port_number(&raft_address)?;
                let api_port = port_number(&api_address)?;
                i32::from(api_port) - i32::from(raft_port)
            }
            _ => {
                warn!("Raft or API listen address is not configured, API port offset is 0");
                0
            }
        };

        Ok(Self {
            port_offset,
            service_name,
        })
    }
}

/// A live connection to one peer's API endpoint
pub struct PooledClient<T> {
    address: String,
    endpoint: String,
    connection: T,
    status: Mutex<HealthStatus>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl<T> PooledClient<T> {
    fn new(address: &str, endpoint: String, connection: T) -> Self {
        Self {
            address: address.to_string(),
            endpoint,
            connection,
            status: Mutex::new(HealthStatus::Unknown),
            health_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Raft address this client was requested for
    pub fn address(&self) -> &str {
        &self.address
    }

    /// API endpoint the connection was opened to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn connection(&self) -> &T {
        &self.connection
    }

    pub fn status(&self) -> HealthStatus {
        *self.status.lock()
    }

    /// Record `status`, returning the previous one
    pub(crate) fn set_status(&self, status: HealthStatus) -> HealthStatus {
        std::mem::replace(&mut *self.status.lock(), status)
    }

    fn set_health_task(&self, handle: JoinHandle<()>) {
        if self.closed.load(Ordering::SeqCst) {
            handle.abort();
            return;
        }
        *self.health_task.lock() = Some(handle);
    }

    /// Stop health tracking and drop the pool's handle.
    ///
    /// Connections are cloneable handles (a tonic `Channel` shares one
    /// underlying connection), so the transport stays open until every clone
    /// already handed to callers has been dropped as well.
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.health_task.lock().take() {
            handle.abort();
        }
        debug!("Closed API client for {}", self.endpoint);
    }
}

enum PoolEntry<T> {
    /// A dial is in flight; the receiver yields the error if it fails
    Connecting {
        attempt: u64,
        done: watch::Receiver<Option<PoolError>>,
    },
    Connected(Arc<PooledClient<T>>),
}

impl<T> PoolEntry<T> {
    fn is_attempt(&self, id: u64) -> bool {
        matches!(self, PoolEntry::Connecting { attempt, .. } if *attempt == id)
    }
}

/// Removes a dial placeholder and wakes its waiters when dropped, so a
/// cancelled dial never strands them
struct ConnectingGuard<'a, T> {
    clients: &'a DashMap<String, PoolEntry<T>>,
    key: &'a str,
    attempt: u64,
    done: watch::Sender<Option<PoolError>>,
}

impl<T> ConnectingGuard<'_, T> {
    fn fail(self, err: PoolError) {
        self.clients
            .remove_if(self.key, |_, entry| entry.is_attempt(self.attempt));
        self.done.send_replace(Some(err));
    }
}

impl<T> Drop for ConnectingGuard<'_, T> {
    fn drop(&mut self) {
        self.clients
            .remove_if(self.key, |_, entry| entry.is_attempt(self.attempt));
    }
}

enum Next<T> {
    Ready(T),
    Wait(watch::Receiver<Option<PoolError>>),
    Dial(u64, watch::Sender<Option<PoolError>>),
}

/// Pool of API connections keyed by Raft peer address.
///
/// At most one dial per address is in flight; concurrent callers wait for it
/// and share its outcome.
pub struct ApiClientPool<C: ApiConnector> {
    connector: Arc<C>,
    config: PoolConfig,
    clients: DashMap<String, PoolEntry<C::Connection>>,
    attempts: AtomicU64,
    closed: AtomicBool,
}

impl<C: ApiConnector> ApiClientPool<C> {
    pub fn new(connector: C, config: PoolConfig) -> Arc<Self> {
        info!(
            "Creating API client pool (port offset {}, health service {:?})",
            config.port_offset, config.service_name
        );
        Arc::new(Self {
            connector: Arc::new(connector),
            config,
            clients: DashMap::new(),
            attempts: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Map a Raft address (`host:port`) to its API endpoint
    pub fn get_api_endpoint(&self, raft_address: &str) -> PoolResult<String> {
        let (host, port) = host_and_port(raft_address)
            .map_err(|_| PoolError::InvalidAddress(raft_address.to_string()))?;

        let api_port = i32::from(port) + self.config.port_offset;
        if !(1..=i32::from(u16::MAX)).contains(&api_port) {
            return Err(PoolError::InvalidAddress(format!(
                "{} (API port {} out of range)",
                raft_address, api_port
            )));
        }

        Ok(format!("{}:{}", host, api_port))
    }

    /// Connection to the API endpoint of the peer at `raft_address`, dialing
    /// it if no connection exists yet
    pub async fn get_connection(self: &Arc<Self>, raft_address: &str) -> PoolResult<C::Connection> {
        loop {
            if self.is_closed() {
                return Err(PoolError::Closed);
            }

            // the map guard must be released before any await
            let next = match self.clients.entry(raft_address.to_string()) {
                Entry::Occupied(entry) => match entry.get() {
                    PoolEntry::Connected(client) => Next::Ready(client.connection().clone()),
                    PoolEntry::Connecting { done, .. } => Next::Wait(done.clone()),
                },
                Entry::Vacant(entry) => {
                    let attempt = self.attempts.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    entry.insert(PoolEntry::Connecting { attempt, done: rx });
                    Next::Dial(attempt, tx)
                }
            };

            match next {
                Next::Ready(connection) => return Ok(connection),
                Next::Wait(mut done) => {
                    // a dropped sender means the dial finished or was abandoned
                    if let Ok(outcome) = done.wait_for(Option::is_some).await {
                        if let Some(err) = outcome.clone() {
                            return Err(err);
                        }
                    }
                }
                Next::Dial(attempt, done) => {
                    let guard = ConnectingGuard {
                        clients: &self.clients,
                        key: raft_address,
                        attempt,
                        done,
                    };
                    return self.dial(raft_address, guard).await;
                }
            }
        }
    }

    async fn dial(
        self: &Arc<Self>,
        raft_address: &str,
        guard: ConnectingGuard<'_, C::Connection>,
    ) -> PoolResult<C::Connection> {
        let connected = match self.get_api_endpoint(raft_address) {
            Ok(endpoint) => self
                .connector
                .connect(&endpoint)
                .await
                .map(|connection| (endpoint, connection)),
            Err(e) => Err(e),
        };

        let (endpoint, connection) = match connected {
            Ok(connected) => connected,
            Err(e) => {
                warn!("Failed to connect to API of raft peer {}: {}", raft_address, e);
                guard.fail(e.clone());
                return Err(e);
            }
        };

        let client = Arc::new(PooledClient::new(raft_address, endpoint, connection));
        self.clients.insert(
            raft_address.to_string(),
            PoolEntry::Connected(client.clone()),
        );
        drop(guard);

        if self.is_closed() {
            self.remove_client(raft_address, &client);
            client.close();
            return Err(PoolError::Closed);
        }

        info!(
            "Connected to API endpoint {} of raft peer {}",
            client.endpoint(),
            raft_address
        );

        if let Some(service) = &self.config.service_name {
            let handle = tokio::spawn(track_health(
                self.connector.clone(),
                client.clone(),
                service.clone(),
                Arc::downgrade(self),
            ));
            client.set_health_task(handle);
        }

        Ok(client.connection().clone())
    }

    /// Drop the entry for `raft_address` if it still holds `client`
    pub(crate) fn remove_client(&self, raft_address: &str, client: &Arc<PooledClient<C::Connection>>) {
        let removed = self.clients.remove_if(raft_address, |_, entry| {
            matches!(entry, PoolEntry::Connected(current) if Arc::ptr_eq(current, client))
        });
        if removed.is_some() {
            info!("Removed API client of raft peer {}", raft_address);
        }
    }

    /// Health last reported by the peer at `raft_address`
    pub fn health_status(&self, raft_address: &str) -> Option<HealthStatus> {
        match self.clients.get(raft_address).as_deref() {
            Some(PoolEntry::Connected(client)) => Some(client.status()),
            _ => None,
        }
    }

    /// Raft addresses with a live connection
    pub fn connected_peers(&self) -> Vec<String> {
        self.clients
            .iter()
            .filter(|entry| matches!(entry.value(), PoolEntry::Connected(_)))
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.clients
            .iter()
            .filter(|entry| matches!(entry.value(), PoolEntry::Connected(_)))
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close every pooled connection. Later calls do nothing.
    ///
    /// Entries are removed and their health tasks aborted, but connection
    /// handles previously returned by [`ApiClientPool::get_connection`] are
    /// owned by their callers and keep working until dropped. New requests
    /// fail with [`PoolError::Closed`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let keys: Vec<String> = self.clients.iter().map(|entry| entry.key().clone()).collect();
        let mut closed = 0;
        for key in keys {
            let removed = self
                .clients
                .remove_if(&key, |_, entry| matches!(entry, PoolEntry::Connected(_)));
            if let Some((_, PoolEntry::Connected(client))) = removed {
                client.close();
                closed += 1;
            }
        }

        info!("API client pool closed ({} connections)", closed);
    }
}

impl<C: ApiConnector> Drop for ApiClientPool<C> {
    fn drop(&mut self) {
        self.close();
    }
}
