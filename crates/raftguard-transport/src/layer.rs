// TCP stream layer for Raft peer traffic
// Dial / accept / close / addr over a bound listener, optionally wrapped in TLS

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

use raftguard_common::tls::{insecure_client_config, server_config};
use raftguard_common::{ConfigError, Configuration, TlsMaterial};

use crate::error::{TransportError, TransportResult};
use crate::stream::{PeerStream, ServerTlsStream};

/// Time an inbound peer gets to complete the TLS handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Network primitive consumed by the Raft transport
#[async_trait]
pub trait StreamLayer: Send + Sync {
    /// Open a connection to a peer's Raft address
    async fn dial(&self, address: &str, timeout: Duration) -> TransportResult<PeerStream>;

    /// Wait for the next inbound peer connection.
    ///
    /// TLS connections are returned before their handshake; it completes on
    /// the first read or write.
    async fn accept(&self) -> TransportResult<(PeerStream, SocketAddr)>;

    /// Stop accepting; pending and later `accept` calls fail with `Closed`
    fn close(&self);

    /// Address peers should use to reach this node
    fn addr(&self) -> SocketAddr;
}

struct TlsSettings {
    connector: TlsConnector,
    acceptor: TlsAcceptor,
}

/// [`StreamLayer`] over TCP, with TLS when material is configured.
///
/// Outbound TLS presents the configured certificate chain and does not verify
/// the server certificate. Inbound TLS requires client certificates when the
/// material carries a client CA pool.
pub struct TcpStreamLayer {
    listener: Mutex<Option<Arc<TcpListener>>>,
    bound: SocketAddr,
    advertise: Option<SocketAddr>,
    tls: Option<TlsSettings>,
    handshake_timeout: Duration,
    shutdown: watch::Sender<bool>,
}

impl TcpStreamLayer {
    /// Wrap `listener`, validating the address peers will be given.
    ///
    /// `advertise` must be a TCP socket address with a concrete IP; without
    /// it the listener's bound address must satisfy the same rule.
    pub fn new(
        listener: TcpListener,
        advertise: Option<&str>,
        tls: Option<&TlsMaterial>,
    ) -> TransportResult<Self> {
        let bound = listener.local_addr()?;
        let advertise = match advertise {
            Some(addr) => Some(
                addr.parse::<SocketAddr>()
                    .map_err(|_| TransportError::NotTcp(addr.to_string()))?,
            ),
            None => None,
        };

        let effective = advertise.unwrap_or(bound);
        if effective.ip().is_unspecified() {
            return Err(TransportError::NotAdvertisable(effective));
        }

        let tls = match tls {
            Some(material) => Some(tls_settings(material)?),
            None => None,
        };

        info!(
            "Raft stream layer listening on {} (advertised {}, tls {})",
            bound,
            effective,
            tls.is_some()
        );

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            listener: Mutex::new(Some(Arc::new(listener))),
            bound,
            advertise,
            tls,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            shutdown,
        })
    }

    /// Bind `raft-server.listen-address` and load the configured TLS material
    pub async fn bind(config: &Configuration, advertise: Option<&str>) -> TransportResult<Self> {
        let address = config.raft_listen_address().ok_or_else(|| {
            ConfigError::MissingProperty(raftguard_common::config::RAFT_LISTEN_ADDRESS.to_string())
        })?;
        let material = config.tls_config().load()?;
        let listener = TcpListener::bind(&address).await?;
        Self::new(listener, advertise, material.as_ref())
    }

    /// Bound the server handshake of accepted TLS connections
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.bound
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn connect(&self, address: &str) -> TransportResult<PeerStream> {
        let tcp = TcpStream::connect(address).await?;
        tcp.set_nodelay(true)?;

        let Some(tls) = &self.tls else {
            return Ok(PeerStream::Plain(tcp));
        };

        let stream = tls.connector.connect(server_name(address)?, tcp).await?;
        Ok(PeerStream::TlsClient(Box::new(stream)))
    }
}

fn tls_settings(material: &TlsMaterial) -> TransportResult<TlsSettings> {
    let client = insecure_client_config(Some(material), Vec::new())?;
    let server = server_config(material)?;
    Ok(TlsSettings {
        connector: TlsConnector::from(Arc::new(client)),
        acceptor: TlsAcceptor::from(Arc::new(server)),
    })
}

/// TLS server name for a `host:port` address; IP literals become IP names
fn server_name(address: &str) -> TransportResult<ServerName<'static>> {
    let host = match address.rsplit_once(':') {
        Some((host, _port)) => host,
        None => address,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string())
        .map_err(|e| TransportError::Tls(format!("invalid server name '{}': {}", host, e)))
}

#[async_trait]
impl StreamLayer for TcpStreamLayer {
    async fn dial(&self, address: &str, timeout: Duration) -> TransportResult<PeerStream> {
        debug!("Dialing raft peer {}", address);
        match tokio::time::timeout(timeout, self.connect(address)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                address: address.to_string(),
                timeout,
            }),
        }
    }

    async fn accept(&self) -> TransportResult<(PeerStream, SocketAddr)> {
        let mut shutdown = self.shutdown.subscribe();
        let listener = self.listener.lock().clone().ok_or(TransportError::Closed)?;

        let (tcp, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.wait_for(|closed| *closed) => return Err(TransportError::Closed),
        };
        tcp.set_nodelay(true)?;

        let Some(tls) = &self.tls else {
            return Ok((PeerStream::Plain(tcp), peer));
        };

        // handshake is deferred to the first read or write
        let local = tcp.local_addr()?;
        let stream = ServerTlsStream::new(
            tls.acceptor.accept(tcp),
            peer,
            local,
            self.handshake_timeout,
        );
        Ok((PeerStream::TlsServer(Box::new(stream)), peer))
    }

    fn close(&self) {
        let previous = self.shutdown.send_replace(true);
        if self.listener.lock().take().is_some() && !previous {
            info!("Raft stream layer on {} closed", self.bound);
        }
    }

    fn addr(&self) -> SocketAddr {
        self.advertise.unwrap_or(self.bound)
    }
}

/// Validate the stream layer and hand it to the transport constructor
pub fn new_tcp_transport<T, F>(
    listener: TcpListener,
    advertise: Option<&str>,
    tls: Option<&TlsMaterial>,
    creator: F,
) -> TransportResult<T>
where
    F: FnOnce(TcpStreamLayer) -> T,
{
    let layer = TcpStreamLayer::new(listener, advertise, tls)?;
    Ok(creator(layer))
}
