// Dialing seam for the API client pool
// GrpcConnector opens TLS gRPC channels; tests substitute their own connector

use std::error::Error as StdError;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use http::Uri;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tonic::Status;
use tonic::transport::{Channel, Endpoint};
use tonic_health::pb::HealthCheckRequest;
use tonic_health::pb::health_client::HealthClient;
use tower::service_fn;
use tracing::debug;

use raftguard_common::tls::{ALPN_H2, insecure_client_config};
use raftguard_common::{Configuration, TlsMaterial};

use crate::error::{PoolError, PoolResult};
use crate::health::HealthStatus;

/// Stream of health updates from a peer
pub type HealthStream = BoxStream<'static, Result<HealthStatus, Status>>;

/// Opens connections to peer API endpoints and speaks the health protocol on them
#[async_trait]
pub trait ApiConnector: Send + Sync + 'static {
    /// Handle handed out to pool callers; cloning must be cheap
    type Connection: Clone + Send + Sync + 'static;

    /// Connect to `endpoint` (`host:port`)
    async fn connect(&self, endpoint: &str) -> PoolResult<Self::Connection>;

    /// One-shot health check of `service`
    async fn check(&self, conn: &Self::Connection, service: &str) -> Result<HealthStatus, Status>;

    /// Stream of health changes of `service`
    async fn watch(&self, conn: &Self::Connection, service: &str) -> Result<HealthStream, Status>;
}

/// gRPC connector over TLS with server certificate verification disabled
#[derive(Clone)]
pub struct GrpcConnector {
    tls: TlsConnector,
    connect_timeout: Duration,
}

impl GrpcConnector {
    /// `material`, when it carries a certificate and key, is presented as the client identity
    pub fn new(connect_timeout: Duration, material: Option<&TlsMaterial>) -> PoolResult<Self> {
        let config = insecure_client_config(material, vec![ALPN_H2.to_vec()])?;
        Ok(Self {
            tls: TlsConnector::from(Arc::new(config)),
            connect_timeout,
        })
    }

    pub fn from_configuration(config: &Configuration) -> PoolResult<Self> {
        let material = config.tls_config().load()?;
        Self::new(
            Duration::from_millis(config.connect_timeout_ms()),
            material.as_ref(),
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

async fn tls_connect(tls: TlsConnector, uri: Uri) -> io::Result<TokioIo<TlsStream<TcpStream>>> {
    let host = uri
        .host()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "endpoint has no host"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = uri
        .port_u16()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "endpoint has no port"))?;

    let tcp = TcpStream::connect((host.as_str(), port)).await?;
    tcp.set_nodelay(true)?;

    let server_name = ServerName::try_from(host)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let stream = tls.connect(server_name, tcp).await?;

    Ok(TokioIo::new(stream))
}

/// Flatten an error and its sources into one line
fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[async_trait]
impl ApiConnector for GrpcConnector {
    type Connection = Channel;

    async fn connect(&self, endpoint: &str) -> PoolResult<Channel> {
        let connect_error = |message: String| PoolError::Connect {
            endpoint: endpoint.to_string(),
            message,
        };

        let target = Endpoint::from_shared(format!("http://{}", endpoint))
            .map_err(|e| connect_error(error_chain(&e)))?
            .connect_timeout(self.connect_timeout);

        let tls = self.tls.clone();
        let connector = service_fn(move |uri: Uri| tls_connect(tls.clone(), uri));

        debug!("Dialing API endpoint {}", endpoint);
        match tokio::time::timeout(self.connect_timeout, target.connect_with_connector(connector))
            .await
        {
            Ok(Ok(channel)) => Ok(channel),
            Ok(Err(e)) => Err(connect_error(error_chain(&e))),
            Err(_) => Err(connect_error(format!(
                "timed out after {:?}",
                self.connect_timeout
            ))),
        }
    }

    async fn check(&self, conn: &Channel, service: &str) -> Result<HealthStatus, Status> {
        let mut client = HealthClient::new(conn.clone());
        let response = client
            .check(HealthCheckRequest {
                service: service.to_string(),
            })
            .await?;
        Ok(HealthStatus::from_wire(response.into_inner().status))
    }

    async fn watch(&self, conn: &Channel, service: &str) -> Result<HealthStream, Status> {
        let mut client = HealthClient::new(conn.clone());
        let updates = client
            .watch(HealthCheckRequest {
                service: service.to_string(),
            })
            .await?
            .into_inner();
        Ok(updates
            .map(|update| update.map(|response| HealthStatus::from_wire(response.status)))
            .boxed())
    }
}
