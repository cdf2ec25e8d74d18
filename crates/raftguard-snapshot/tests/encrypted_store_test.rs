//! End-to-end tests for the encrypted file snapshot store

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

use openraft::{BasicNode, Membership, StoredMembership};

use raftguard_snapshot::crypto::BLOCK_SIZE;
use raftguard_snapshot::{
    EncryptedSnapshotStore, FileSnapshotStore, KeyDerivation, SnapshotError, SnapshotStore,
    SnapshotVersion,
};

fn membership() -> StoredMembership<u64, BasicNode> {
    let voters = BTreeSet::from([1u64]);
    let nodes = BTreeMap::from([(1u64, BasicNode::new("127.0.0.1:7000"))]);
    StoredMembership::new(None, Membership::new(vec![voters], nodes))
}

#[test]
fn test_encrypted_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let file_store = FileSnapshotStore::new(dir.path(), 2).unwrap();
    let store = EncryptedSnapshotStore::new(file_store, "123");

    let mut sink = store
        .create(SnapshotVersion::MAX, 10, 3, membership())
        .unwrap();
    let id = sink.id().to_string();

    let mut buf = b"Hello World!".to_vec();
    let n = sink.write_in_place(&mut buf).unwrap();
    assert_eq!(n, 12);
    // the caller's buffer now holds ciphertext
    assert_ne!(buf, b"Hello World!");
    sink.close().unwrap();

    let snapshots = store.list().unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].id, id);
    assert_eq!(snapshots[0].index, 10);
    assert_eq!(snapshots[0].term, 3);
    assert_eq!(snapshots[0].size, (BLOCK_SIZE + 12) as u64);
    assert_eq!(snapshots[0].membership, membership());

    let (meta, mut reader) = store.open(&id).unwrap();
    assert_eq!(meta.id, id);
    let mut content = Vec::new();
    reader.read_to_end(&mut content).unwrap();
    assert_eq!(content, b"Hello World!");
}

#[test]
fn test_disk_holds_ciphertext() {
    let dir = tempfile::tempdir().unwrap();
    let store = EncryptedSnapshotStore::new(FileSnapshotStore::new(dir.path(), 2).unwrap(), "123");

    let mut sink = store
        .create(SnapshotVersion::MAX, 1, 1, membership())
        .unwrap();
    let id = sink.id().to_string();
    sink.write_all(b"Hello World!").unwrap();
    sink.close().unwrap();

    let plain = FileSnapshotStore::new(dir.path(), 2).unwrap();
    let (_, mut reader) = plain.open(&id).unwrap();
    let mut raw = Vec::new();
    reader.read_to_end(&mut raw).unwrap();
    assert_eq!(raw.len(), BLOCK_SIZE + 12);
    assert_ne!(&raw[BLOCK_SIZE..], b"Hello World!");
}

#[test]
fn test_wrong_token_cannot_read() {
    let dir = tempfile::tempdir().unwrap();
    let writer = EncryptedSnapshotStore::new(FileSnapshotStore::new(dir.path(), 2).unwrap(), "123");

    let mut sink = writer
        .create(SnapshotVersion::MAX, 1, 1, membership())
        .unwrap();
    let id = sink.id().to_string();
    sink.write_all(b"Hello World!").unwrap();
    sink.close().unwrap();

    let reader_store =
        EncryptedSnapshotStore::new(FileSnapshotStore::new(dir.path(), 2).unwrap(), "456");
    let (_, mut reader) = reader_store.open(&id).unwrap();
    let mut content = Vec::new();
    reader.read_to_end(&mut content).unwrap();
    assert_ne!(content, b"Hello World!");
}

#[test]
fn test_per_snapshot_keys_round_trip_with_retention() {
    let dir = tempfile::tempdir().unwrap();
    let store = EncryptedSnapshotStore::with_derivation(
        FileSnapshotStore::new(dir.path(), 2).unwrap(),
        "123",
        KeyDerivation::PerSnapshot,
    );

    for index in [10u64, 20, 30] {
        let mut sink = store
            .create(SnapshotVersion::MAX, index, 1, membership())
            .unwrap();
        write!(sink, "state at {}", index).unwrap();
        sink.close().unwrap();
    }

    let snapshots = store.list().unwrap();
    assert_eq!(snapshots.len(), 2);

    for meta in snapshots {
        let (_, mut reader) = store.open(&meta.id).unwrap();
        let mut content = String::new();
        reader.read_to_string(&mut content).unwrap();
        assert_eq!(content, format!("state at {}", meta.index));
    }
}

#[test]
fn test_cancelled_snapshot_is_not_listed() {
    let dir = tempfile::tempdir().unwrap();
    let store = EncryptedSnapshotStore::new(FileSnapshotStore::new(dir.path(), 2).unwrap(), "123");

    let mut sink = store
        .create(SnapshotVersion::MAX, 1, 1, membership())
        .unwrap();
    sink.write_all(b"discard me").unwrap();
    sink.cancel().unwrap();

    assert!(store.list().unwrap().is_empty());
}

#[test]
fn test_unsupported_version_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = EncryptedSnapshotStore::new(FileSnapshotStore::new(dir.path(), 2).unwrap(), "123");

    let result = store.create(SnapshotVersion(2), 1, 1, membership());
    assert!(matches!(result, Err(SnapshotError::UnsupportedVersion(2))));
}
