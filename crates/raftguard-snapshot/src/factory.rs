// Snapshot store wiring from configuration

use std::fs;
use std::path::PathBuf;

use tracing::{info, warn};

use raftguard_common::config::SNAPSHOT_TOKEN;
use raftguard_common::{ConfigError, Configuration};

use crate::encrypted::{EncryptedSnapshotStore, KeyDerivation};
use crate::file::FileSnapshotStore;
use crate::store::{SnapshotResult, SnapshotStore};

/// Directory under the data directory holding Raft snapshots
pub const SNAPSHOT_DIR_NAME: &str = "raft-snapshot";

/// Builds the snapshot store described by the configuration.
///
/// The file store lives in `<data dir>/raft-snapshot`, where the data
/// directory defaults to `<application.dir>/db/<application.name>`. When a
/// token is configured the file store is wrapped with encryption; when
/// encryption is required and no token exists construction fails.
#[derive(Debug, Clone)]
pub struct SnapshotStoreFactory {
    config: Configuration,
}

impl SnapshotStoreFactory {
    pub fn new(config: Configuration) -> Self {
        Self { config }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.config.data_dir().unwrap_or_else(|| {
            self.config
                .application_dir()
                .join("db")
                .join(self.config.application_name())
        })
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir().join(SNAPSHOT_DIR_NAME)
    }

    pub fn build(&self) -> SnapshotResult<Box<dyn SnapshotStore>> {
        let token = self.config.snapshot_token();
        if self.config.snapshot_encrypted() && token.is_none() {
            return Err(ConfigError::MissingProperty(SNAPSHOT_TOKEN.to_string()).into());
        }

        let dir = self.snapshot_dir();
        let mode = self.config.data_dir_perm()?;
        create_dir(&dir, mode)?;

        let retain = self.config.snapshot_retain_count();
        let store = FileSnapshotStore::new(&dir, retain)?;

        match token {
            Some(token) => {
                let derivation = if self.config.snapshot_per_snapshot_key() {
                    KeyDerivation::PerSnapshot
                } else {
                    KeyDerivation::Token
                };
                info!(
                    "Raft snapshots encrypted at {:?} (retain {}, {:?} keys)",
                    dir, retain, derivation
                );
                Ok(Box::new(EncryptedSnapshotStore::with_derivation(
                    store, token, derivation,
                )))
            }
            None => {
                warn!("Raft snapshots are stored unencrypted at {:?}", dir);
                Ok(Box::new(store))
            }
        }
    }
}

#[cfg(unix)]
fn create_dir(dir: &std::path::Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

    fs::DirBuilder::new().recursive(true).mode(mode).create(dir)?;
    // DirBuilder honours the umask; apply the exact bits on the leaf
    fs::set_permissions(dir, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn create_dir(dir: &std::path::Path, _mode: u32) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}
