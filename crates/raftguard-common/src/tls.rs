//! TLS configuration for Raft peer traffic
//!
//! Loads PEM certificate material and builds the rustls configs used by the
//! peer stream layer and the API client pool.
//!
//! Trust model: peers are trusted through network isolation and out-of-band
//! provisioning, not through the X.509 chain. Client configs therefore skip
//! server certificate verification via [`SkipServerVerification`]. Handshake
//! signatures are still checked against whatever certificate the server
//! presents. Adding peer identity checks means replacing that verifier; no
//! caller needs to change.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};

use tracing::info;

use crate::error::{ConfigError, ConfigResult};

/// ALPN protocol id for HTTP/2, required by gRPC over TLS
pub const ALPN_H2: &[u8] = b"h2";

/// Paths to PEM encoded TLS material
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Path to the certificate chain file (PEM format)
    pub cert_path: Option<PathBuf>,
    /// Path to the private key file (PEM format)
    pub key_path: Option<PathBuf>,
    /// Path to the CA bundle used to verify client certificates
    pub ca_cert_path: Option<PathBuf>,
}

impl TlsConfig {
    /// Check if a certificate and key are configured
    pub fn is_configured(&self) -> bool {
        self.cert_path.is_some() && self.key_path.is_some()
    }

    /// Load the configured material, or `None` when TLS is not configured
    pub fn load(&self) -> ConfigResult<Option<TlsMaterial>> {
        let (Some(cert_path), Some(key_path)) = (&self.cert_path, &self.key_path) else {
            if self.cert_path.is_some() || self.key_path.is_some() {
                return Err(ConfigError::Tls(
                    "certificate and private key must be configured together".to_string(),
                ));
            }
            return Ok(None);
        };

        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;
        let client_cas = match &self.ca_cert_path {
            Some(path) => Some(load_root_store(path)?),
            None => None,
        };

        info!(
            "Loaded TLS certificate chain from {:?} ({} certificates, client CAs {})",
            cert_path,
            certs.len(),
            client_cas.is_some()
        );

        Ok(Some(TlsMaterial {
            certs,
            key: Some(key),
            client_cas,
        }))
    }
}

/// Decoded TLS material: certificate chain, private key and client CA pool
#[derive(Debug)]
pub struct TlsMaterial {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: Option<PrivateKeyDer<'static>>,
    pub client_cas: Option<RootCertStore>,
}

impl Clone for TlsMaterial {
    fn clone(&self) -> Self {
        Self {
            certs: self.certs.clone(),
            key: self.key.as_ref().map(|k| k.clone_key()),
            client_cas: self.client_cas.clone(),
        }
    }
}

impl TlsMaterial {
    /// Material holding a certificate chain and its private key
    pub fn new(certs: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self {
            certs,
            key: Some(key),
            client_cas: None,
        }
    }

    /// Require client certificates signed by one of `roots` on accepted connections
    pub fn with_client_cas(mut self, roots: RootCertStore) -> Self {
        self.client_cas = Some(roots);
        self
    }

    fn identity(&self) -> Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        match &self.key {
            Some(key) if !self.certs.is_empty() => Some((self.certs.clone(), key.clone_key())),
            _ => None,
        }
    }
}

/// Crypto provider shared by every config built here
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Client config with server certificate verification disabled.
///
/// When `material` carries a certificate chain and key they are presented as
/// the client identity.
pub fn insecure_client_config(
    material: Option<&TlsMaterial>,
    alpn_protocols: Vec<Vec<u8>>,
) -> ConfigResult<ClientConfig> {
    let provider = crypto_provider();
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ConfigError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification::new(provider)));

    let mut config = match material.and_then(TlsMaterial::identity) {
        Some((certs, key)) => builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| ConfigError::Tls(e.to_string()))?,
        None => builder.with_no_client_auth(),
    };
    config.alpn_protocols = alpn_protocols;

    Ok(config)
}

/// Server config presenting the configured identity.
///
/// Client certificates are required and verified against `client_cas` when a
/// CA pool is present.
pub fn server_config(material: &TlsMaterial) -> ConfigResult<ServerConfig> {
    let (certs, key) = material
        .identity()
        .ok_or_else(|| ConfigError::Tls("server identity requires a certificate and key".to_string()))?;

    let provider = crypto_provider();
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ConfigError::Tls(e.to_string()))?;

    let builder = match &material.client_cas {
        Some(roots) => {
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots.clone()), provider)
                .build()
                .map_err(|e| ConfigError::Tls(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    builder
        .with_single_cert(certs, key)
        .map_err(|e| ConfigError::Tls(e.to_string()))
}

/// Accepts any server certificate while still verifying handshake signatures
#[derive(Debug)]
pub struct SkipServerVerification {
    provider: Arc<CryptoProvider>,
}

impl SkipServerVerification {
    pub fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Load a PEM certificate chain
pub fn load_certs(path: &Path) -> ConfigResult<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Tls(format!("{:?}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(ConfigError::Tls(format!("no certificates found in {:?}", path)));
    }
    Ok(certs)
}

/// Load the first PEM private key (PKCS#8, PKCS#1 or SEC1)
pub fn load_private_key(path: &Path) -> ConfigResult<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ConfigError::Tls(format!("{:?}: {}", path, e)))?
        .ok_or_else(|| ConfigError::Tls(format!("no private key found in {:?}", path)))
}

/// Load a PEM CA bundle into a root store
pub fn load_root_store(path: &Path) -> ConfigResult<RootCertStore> {
    let certs = load_certs(path)?;
    let mut roots = RootCertStore::empty();
    let (added, _ignored) = roots.add_parsable_certificates(certs);
    if added == 0 {
        return Err(ConfigError::Tls(format!("no usable CA certificates in {:?}", path)));
    }
    Ok(roots)
}
