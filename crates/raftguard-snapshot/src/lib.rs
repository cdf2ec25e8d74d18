//! Raft snapshot storage with optional at-rest encryption
//!
//! - [`file::FileSnapshotStore`] keeps snapshots on local disk
//! - [`encrypted::EncryptedSnapshotStore`] wraps any store with AES-256-CTR
//! - [`factory::SnapshotStoreFactory`] builds the configured store

pub mod crypto;
pub mod encrypted;
pub mod factory;
pub mod file;
pub mod store;

pub use crypto::{CipherReader, CipherWriter, CryptoError, CryptoResult, SessionKey};
pub use encrypted::{EncryptedSnapshotStore, KeyDerivation};
pub use factory::SnapshotStoreFactory;
pub use file::FileSnapshotStore;
pub use store::{
    SnapshotError, SnapshotMeta, SnapshotReader, SnapshotResult, SnapshotSink, SnapshotStore,
    SnapshotVersion,
};
