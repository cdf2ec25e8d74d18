//! Configuration access for raftguard components
//!
//! Values are read from an optional YAML/TOML file plus `raftguard.*`
//! environment overrides. Components never read the raw `config::Config`;
//! they receive already-resolved values through the typed getters below.

use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::tls::TlsConfig;

pub const RAFT_LISTEN_ADDRESS: &str = "raft-server.listen-address";
pub const RAFT_API_BEAN: &str = "raft-server.api-bean";
pub const RAFT_SERVICE_NAME: &str = "raft-server.raft-service-name";
pub const RAFT_CONNECT_TIMEOUT: &str = "raft-server.connect-timeout";
pub const RAFT_TLS_CERT_PATH: &str = "raft-server.tls.cert.path";
pub const RAFT_TLS_KEY_PATH: &str = "raft-server.tls.key.path";
pub const RAFT_TLS_CA_CERT_PATH: &str = "raft-server.tls.ca.cert.path";

pub const SNAPSHOT_RETAIN_COUNT: &str = "raft-snapshot.retain-count";
pub const SNAPSHOT_ENCRYPTED: &str = "raft-snapshot.encrypted";
pub const SNAPSHOT_TOKEN: &str = "raft-snapshot.token";
pub const SNAPSHOT_PER_SNAPSHOT_KEY: &str = "raft-snapshot.per-snapshot-key";

pub const APPLICATION_NAME: &str = "application.name";
pub const APPLICATION_DIR: &str = "application.dir";
pub const APPLICATION_DATA_DIR: &str = "application.data.dir";
pub const APPLICATION_DATA_DIR_PERM: &str = "application.perm.data.dir";

const DEFAULT_APPLICATION_NAME: &str = "raftguard";
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
const DEFAULT_RETAIN_COUNT: usize = 2;
const DEFAULT_DATA_DIR_PERM: u32 = 0o770;

/// Application configuration wrapper
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: Config,
}

impl Configuration {
    /// Create a configuration from an already built `Config`
    pub fn from_config(config: Config) -> Self {
        Self { config }
    }

    /// Load configuration from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            debug!("Loading configuration from {:?}", path);
            builder = builder.add_source(File::from(path));
        }
        let config = builder
            .add_source(
                Environment::with_prefix("raftguard")
                    .separator(".")
                    .try_parsing(true),
            )
            .build()?;

        Ok(Self { config })
    }

    fn non_empty_string(&self, key: &str) -> Option<String> {
        self.config
            .get_string(key)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    // ===================== Raft Server =====================

    /// Raft listen address (`host:port`)
    pub fn raft_listen_address(&self) -> Option<String> {
        self.non_empty_string(RAFT_LISTEN_ADDRESS)
    }

    /// Name of the configuration section describing the co-located API server
    pub fn api_bean(&self) -> Option<String> {
        self.non_empty_string(RAFT_API_BEAN)
    }

    /// API listen address resolved through the `raft-server.api-bean` reference.
    ///
    /// Returns `Ok(None)` when no API bean is configured and an error when the
    /// bean is named but its `listen-address` is empty.
    pub fn api_listen_address(&self) -> ConfigResult<Option<String>> {
        let Some(bean) = self.api_bean() else {
            return Ok(None);
        };

        let key = format!("{}.listen-address", bean);
        match self.non_empty_string(&key) {
            Some(value) => Ok(Some(value)),
            None => Err(ConfigError::MissingProperty(key)),
        }
    }

    /// gRPC health service name watched on every pooled peer
    pub fn raft_service_name(&self) -> Option<String> {
        self.non_empty_string(RAFT_SERVICE_NAME)
    }

    /// Dial timeout for pooled API connections in milliseconds (default: 5000ms)
    pub fn connect_timeout_ms(&self) -> u64 {
        self.config
            .get_int(RAFT_CONNECT_TIMEOUT)
            .map(|v| v.max(1) as u64)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS)
    }

    /// TLS material used by the peer stream layer
    pub fn tls_config(&self) -> TlsConfig {
        TlsConfig {
            cert_path: self.non_empty_string(RAFT_TLS_CERT_PATH).map(PathBuf::from),
            key_path: self.non_empty_string(RAFT_TLS_KEY_PATH).map(PathBuf::from),
            ca_cert_path: self
                .non_empty_string(RAFT_TLS_CA_CERT_PATH)
                .map(PathBuf::from),
        }
    }

    // ===================== Raft Snapshot =====================

    /// Number of snapshots kept on disk (default: 2)
    pub fn snapshot_retain_count(&self) -> usize {
        self.config
            .get_int(SNAPSHOT_RETAIN_COUNT)
            .map(|v| v.max(1) as usize)
            .unwrap_or(DEFAULT_RETAIN_COUNT)
    }

    /// Whether snapshot encryption is mandatory
    pub fn snapshot_encrypted(&self) -> bool {
        self.config.get_bool(SNAPSHOT_ENCRYPTED).unwrap_or(false)
    }

    /// Shared snapshot encryption token
    pub fn snapshot_token(&self) -> Option<String> {
        self.non_empty_string(SNAPSHOT_TOKEN)
    }

    /// Whether session keys are diversified by snapshot index and term
    pub fn snapshot_per_snapshot_key(&self) -> bool {
        self.config
            .get_bool(SNAPSHOT_PER_SNAPSHOT_KEY)
            .unwrap_or(false)
    }

    // ===================== Application =====================

    pub fn application_name(&self) -> String {
        self.non_empty_string(APPLICATION_NAME)
            .unwrap_or_else(|| DEFAULT_APPLICATION_NAME.to_string())
    }

    pub fn application_dir(&self) -> PathBuf {
        self.non_empty_string(APPLICATION_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Explicit data directory, if configured
    pub fn data_dir(&self) -> Option<PathBuf> {
        self.non_empty_string(APPLICATION_DATA_DIR).map(PathBuf::from)
    }

    /// Unix permission bits for data directories (default: 0o770)
    pub fn data_dir_perm(&self) -> ConfigResult<u32> {
        match self.non_empty_string(APPLICATION_DATA_DIR_PERM) {
            Some(value) => parse_mode(&value).ok_or_else(|| ConfigError::InvalidProperty {
                key: APPLICATION_DATA_DIR_PERM.to_string(),
                message: format!("'{}' is not a file mode", value),
            }),
            None => Ok(DEFAULT_DATA_DIR_PERM),
        }
    }
}

/// Parse a file mode given either as octal digits (`770`, `0770`) or in
/// `ls -l` form (`-rwxrwx---`, `drwxr-x---`).
pub fn parse_mode(value: &str) -> Option<u32> {
    if value.len() == 10 && !value.chars().all(|c| c.is_ascii_digit()) {
        let mut mode = 0u32;
        for (i, c) in value.chars().skip(1).enumerate() {
            let expected = ['r', 'w', 'x'][i % 3];
            mode <<= 1;
            if c == expected {
                mode |= 1;
            } else if c != '-' {
                return None;
            }
        }
        return Some(mode);
    }

    u32::from_str_radix(value, 8).ok().filter(|m| *m <= 0o7777)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configuration(pairs: &[(&str, &str)]) -> Configuration {
        let mut builder = Config::builder();
        for (k, v) in pairs {
            builder = builder.set_override(*k, *v).unwrap();
        }
        Configuration::from_config(builder.build().unwrap())
    }

    #[test]
    fn test_defaults() {
        let config = Configuration::default();
        assert!(config.raft_listen_address().is_none());
        assert!(config.api_listen_address().unwrap().is_none());
        assert!(config.raft_service_name().is_none());
        assert_eq!(config.connect_timeout_ms(), 5000);
        assert_eq!(config.snapshot_retain_count(), 2);
        assert!(!config.snapshot_encrypted());
        assert!(config.snapshot_token().is_none());
        assert_eq!(config.application_name(), "raftguard");
        assert_eq!(config.data_dir_perm().unwrap(), 0o770);
    }

    #[test]
    fn test_api_listen_address_via_bean() {
        let config = configuration(&[
            (RAFT_API_BEAN, "grpc-server"),
            ("grpc-server.listen-address", "0.0.0.0:9005"),
        ]);
        assert_eq!(
            config.api_listen_address().unwrap().as_deref(),
            Some("0.0.0.0:9005")
        );
    }

    #[test]
    fn test_api_bean_without_address_fails() {
        let config = configuration(&[(RAFT_API_BEAN, "grpc-server")]);
        let err = config.api_listen_address().unwrap_err();
        assert!(matches!(err, ConfigError::MissingProperty(ref k) if k == "grpc-server.listen-address"));
    }

    #[test]
    fn test_empty_values_are_absent() {
        let config = configuration(&[(SNAPSHOT_TOKEN, "  "), (RAFT_SERVICE_NAME, "")]);
        assert!(config.snapshot_token().is_none());
        assert!(config.raft_service_name().is_none());
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("770"), Some(0o770));
        assert_eq!(parse_mode("0750"), Some(0o750));
        assert_eq!(parse_mode("-rwxrwx---"), Some(0o770));
        assert_eq!(parse_mode("-rw-rw-r--"), Some(0o664));
        assert_eq!(parse_mode("drwxr-x---"), Some(0o750));
        assert_eq!(parse_mode("-rwzrwx---"), None);
        assert_eq!(parse_mode("999"), None);
    }

    #[test]
    fn test_tls_config_paths() {
        let config = configuration(&[
            (RAFT_TLS_CERT_PATH, "/etc/raft/cert.pem"),
            (RAFT_TLS_KEY_PATH, "/etc/raft/key.pem"),
        ]);
        let tls = config.tls_config();
        assert!(tls.is_configured());
        assert!(tls.ca_cert_path.is_none());
    }
}
