// Snapshot store contract
// Mirrors the create / list / open shape the consensus layer drives during log compaction

use std::io::{self, Read, Write};

use openraft::{BasicNode, CommittedLeaderId, LogId, StoredMembership};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use raftguard_common::{ConfigError, NodeId};

use crate::crypto::CryptoError;

/// Snapshot format version understood by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotVersion(pub u8);

impl SnapshotVersion {
    pub const MIN: SnapshotVersion = SnapshotVersion(0);
    pub const MAX: SnapshotVersion = SnapshotVersion(1);

    pub fn is_supported(self) -> bool {
        self >= Self::MIN && self <= Self::MAX
    }
}

/// Errors raised by snapshot stores
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u8),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("snapshot '{0}' not found")]
    NotFound(String),

    #[error("snapshot '{id}' checksum mismatch")]
    ChecksumMismatch { id: String },

    #[error("snapshot encryption error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("snapshot configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("snapshot metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for snapshot operations
pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Metadata recorded next to every snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub version: SnapshotVersion,
    pub id: String,
    /// Index of the last log entry included in the snapshot
    pub index: u64,
    /// Term of the last log entry included in the snapshot
    pub term: u64,
    /// Cluster configuration and the log index it was committed at
    pub membership: StoredMembership<NodeId, BasicNode>,
    /// Size of the stored payload in bytes
    pub size: u64,
    /// Hex encoded SHA-256 of the stored payload
    pub checksum: String,
}

impl SnapshotMeta {
    /// Convert into openraft snapshot metadata
    pub fn to_openraft(&self) -> openraft::SnapshotMeta<NodeId, BasicNode> {
        openraft::SnapshotMeta {
            last_log_id: Some(LogId::new(CommittedLeaderId::new(self.term, 0), self.index)),
            last_membership: self.membership.clone(),
            snapshot_id: self.id.clone(),
        }
    }
}

/// Destination for a snapshot being written.
///
/// The sink is finished with exactly one of [`SnapshotSink::close`] or
/// [`SnapshotSink::cancel`]; dropping it without either leaves an incomplete
/// snapshot behind that stores clean up on their own terms.
pub trait SnapshotSink: Write + Send {
    /// Identifier of the snapshot being written
    fn id(&self) -> &str;

    /// Write `buf`, allowing the sink to transform it in place.
    ///
    /// Plain sinks leave `buf` untouched. Encrypting sinks leave ciphertext in
    /// it, so callers must treat `buf` as invalidated after this call.
    fn write_in_place(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.write_all(buf)?;
        Ok(buf.len())
    }

    /// Finish the snapshot and make it visible to `list` / `open`
    fn close(self: Box<Self>) -> SnapshotResult<()>;

    /// Abandon the snapshot
    fn cancel(self: Box<Self>) -> SnapshotResult<()>;
}

impl<S: SnapshotSink + ?Sized> SnapshotSink for Box<S> {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn write_in_place(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).write_in_place(buf)
    }

    fn close(self: Box<Self>) -> SnapshotResult<()> {
        (*self).close()
    }

    fn cancel(self: Box<Self>) -> SnapshotResult<()> {
        (*self).cancel()
    }
}

/// Readable snapshot payload; closing is dropping
pub type SnapshotReader = Box<dyn Read + Send>;

/// Durable snapshot storage driven by the consensus layer
pub trait SnapshotStore: Send + Sync {
    /// Start a new snapshot covering the log up to `index` / `term`
    fn create(
        &self,
        version: SnapshotVersion,
        index: u64,
        term: u64,
        membership: StoredMembership<NodeId, BasicNode>,
    ) -> SnapshotResult<Box<dyn SnapshotSink>>;

    /// Available snapshots, newest first
    fn list(&self) -> SnapshotResult<Vec<SnapshotMeta>>;

    /// Open a snapshot for reading
    fn open(&self, id: &str) -> SnapshotResult<(SnapshotMeta, SnapshotReader)>;
}
