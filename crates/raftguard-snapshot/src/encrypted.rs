// Encrypting snapshot store decorator
// Wraps any SnapshotStore; state bytes are encrypted on create and decrypted on open

use std::fmt;
use std::io;

use openraft::{BasicNode, StoredMembership};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use raftguard_common::NodeId;

use crate::crypto::{CipherReader, CipherWriter, SessionKey};
use crate::store::{
    SnapshotMeta, SnapshotReader, SnapshotResult, SnapshotSink, SnapshotStore, SnapshotVersion,
};

/// How the session key is derived from the shared token
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyDerivation {
    /// SHA-256 of the token; every snapshot shares the key
    #[default]
    Token,
    /// SHA-256 over the token, snapshot index and term
    PerSnapshot,
}

/// Snapshot store encrypting the payload of a delegate store.
///
/// Metadata stays in the clear and `list` is a passthrough. The size and
/// checksum reported for a snapshot describe the stored ciphertext, which
/// is one IV block longer than the plaintext.
pub struct EncryptedSnapshotStore<S> {
    delegate: S,
    token: Zeroizing<String>,
    derivation: KeyDerivation,
}

impl<S: SnapshotStore> EncryptedSnapshotStore<S> {
    pub fn new(delegate: S, token: impl Into<String>) -> Self {
        Self::with_derivation(delegate, token, KeyDerivation::default())
    }

    pub fn with_derivation(delegate: S, token: impl Into<String>, derivation: KeyDerivation) -> Self {
        Self {
            delegate,
            token: Zeroizing::new(token.into()),
            derivation,
        }
    }

    pub fn delegate(&self) -> &S {
        &self.delegate
    }

    pub fn derivation(&self) -> KeyDerivation {
        self.derivation
    }

    fn session_key(&self, index: u64, term: u64) -> SessionKey {
        match self.derivation {
            KeyDerivation::Token => SessionKey::from_token(&self.token),
            KeyDerivation::PerSnapshot => SessionKey::for_snapshot(&self.token, index, term),
        }
    }
}

impl<S> fmt::Debug for EncryptedSnapshotStore<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedSnapshotStore")
            .field("derivation", &self.derivation)
            .finish_non_exhaustive()
    }
}

impl<S: SnapshotStore> SnapshotStore for EncryptedSnapshotStore<S> {
    fn create(
        &self,
        version: SnapshotVersion,
        index: u64,
        term: u64,
        membership: StoredMembership<NodeId, BasicNode>,
    ) -> SnapshotResult<Box<dyn SnapshotSink>> {
        let sink = self.delegate.create(version, index, term, membership)?;
        let key = self.session_key(index, term);
        let writer = match CipherWriter::try_new(&key, sink) {
            Ok(writer) => writer,
            Err((err, sink)) => {
                let id = sink.id().to_string();
                if let Err(e) = sink.cancel() {
                    warn!("Failed to cancel snapshot {}: {}", id, e);
                }
                return Err(err.into());
            }
        };
        debug!("Encrypting snapshot {}", writer.get_ref().id());
        Ok(Box::new(writer))
    }

    fn list(&self) -> SnapshotResult<Vec<SnapshotMeta>> {
        self.delegate.list()
    }

    fn open(&self, id: &str) -> SnapshotResult<(SnapshotMeta, SnapshotReader)> {
        let (meta, source) = self.delegate.open(id)?;
        let key = self.session_key(meta.index, meta.term);
        let reader = CipherReader::new(&key, source)?;
        Ok((meta, Box::new(reader)))
    }
}

impl<S: SnapshotSink> SnapshotSink for CipherWriter<S> {
    fn id(&self) -> &str {
        self.get_ref().id()
    }

    fn write_in_place(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        CipherWriter::write_in_place(self, buf)
    }

    fn close(self: Box<Self>) -> SnapshotResult<()> {
        Box::new((*self).into_inner()).close()
    }

    fn cancel(self: Box<Self>) -> SnapshotResult<()> {
        Box::new((*self).into_inner()).cancel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{Read, Write};
    use std::sync::{Arc, Mutex};

    use crate::crypto::BLOCK_SIZE;
    use crate::store::SnapshotError;

    /// In-memory delegate recording what reached it
    #[derive(Default, Clone)]
    struct MemoryStore {
        written: Arc<Mutex<Vec<u8>>>,
        closed: Arc<Mutex<bool>>,
        cancelled: Arc<Mutex<bool>>,
    }

    struct MemorySink(MemoryStore);

    impl Write for MemorySink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SnapshotSink for MemorySink {
        fn id(&self) -> &str {
            "1-10-0"
        }

        fn close(self: Box<Self>) -> SnapshotResult<()> {
            *self.0.closed.lock().unwrap() = true;
            Ok(())
        }

        fn cancel(self: Box<Self>) -> SnapshotResult<()> {
            *self.0.cancelled.lock().unwrap() = true;
            Ok(())
        }
    }

    impl SnapshotStore for MemoryStore {
        fn create(
            &self,
            _version: SnapshotVersion,
            _index: u64,
            _term: u64,
            _membership: StoredMembership<NodeId, BasicNode>,
        ) -> SnapshotResult<Box<dyn SnapshotSink>> {
            Ok(Box::new(MemorySink(self.clone())))
        }

        fn list(&self) -> SnapshotResult<Vec<SnapshotMeta>> {
            Ok(vec![self.meta()])
        }

        fn open(&self, _id: &str) -> SnapshotResult<(SnapshotMeta, SnapshotReader)> {
            let bytes = self.written.lock().unwrap().clone();
            Ok((self.meta(), Box::new(io::Cursor::new(bytes))))
        }
    }

    impl MemoryStore {
        fn meta(&self) -> SnapshotMeta {
            SnapshotMeta {
                version: SnapshotVersion::MAX,
                id: "1-10-0".to_string(),
                index: 10,
                term: 1,
                membership: StoredMembership::default(),
                size: self.written.lock().unwrap().len() as u64,
                checksum: String::new(),
            }
        }
    }

    struct FailingStore;

    impl SnapshotStore for FailingStore {
        fn create(
            &self,
            _version: SnapshotVersion,
            _index: u64,
            _term: u64,
            _membership: StoredMembership<NodeId, BasicNode>,
        ) -> SnapshotResult<Box<dyn SnapshotSink>> {
            Err(SnapshotError::InvalidArgument("no space".to_string()))
        }

        fn list(&self) -> SnapshotResult<Vec<SnapshotMeta>> {
            Ok(Vec::new())
        }

        fn open(&self, id: &str) -> SnapshotResult<(SnapshotMeta, SnapshotReader)> {
            Err(SnapshotError::NotFound(id.to_string()))
        }
    }

    /// File store whose sinks reject every write
    struct BrokenDiskStore(crate::file::FileSnapshotStore);

    struct BrokenSink(Box<dyn SnapshotSink>);

    impl Write for BrokenSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SnapshotSink for BrokenSink {
        fn id(&self) -> &str {
            self.0.id()
        }

        fn close(self: Box<Self>) -> SnapshotResult<()> {
            self.0.close()
        }

        fn cancel(self: Box<Self>) -> SnapshotResult<()> {
            self.0.cancel()
        }
    }

    impl SnapshotStore for BrokenDiskStore {
        fn create(
            &self,
            version: SnapshotVersion,
            index: u64,
            term: u64,
            membership: StoredMembership<NodeId, BasicNode>,
        ) -> SnapshotResult<Box<dyn SnapshotSink>> {
            let sink = self.0.create(version, index, term, membership)?;
            Ok(Box::new(BrokenSink(sink)))
        }

        fn list(&self) -> SnapshotResult<Vec<SnapshotMeta>> {
            self.0.list()
        }

        fn open(&self, id: &str) -> SnapshotResult<(SnapshotMeta, SnapshotReader)> {
            self.0.open(id)
        }
    }

    fn create(store: &impl SnapshotStore) -> Box<dyn SnapshotSink> {
        store
            .create(SnapshotVersion::MAX, 10, 1, StoredMembership::default())
            .unwrap()
    }

    #[test]
    fn test_sink_passes_through_id_and_close() {
        let delegate = MemoryStore::default();
        let store = EncryptedSnapshotStore::new(delegate.clone(), "123");

        let mut sink = create(&store);
        assert_eq!(sink.id(), "1-10-0");
        sink.write_all(b"data").unwrap();
        sink.close().unwrap();

        assert!(*delegate.closed.lock().unwrap());
        assert_eq!(delegate.written.lock().unwrap().len(), BLOCK_SIZE + 4);
    }

    #[test]
    fn test_cancel_passes_through() {
        let delegate = MemoryStore::default();
        let store = EncryptedSnapshotStore::new(delegate.clone(), "123");

        create(&store).cancel().unwrap();
        assert!(*delegate.cancelled.lock().unwrap());
        assert!(!*delegate.closed.lock().unwrap());
    }

    #[test]
    fn test_in_place_write_through_trait_object() {
        let delegate = MemoryStore::default();
        let store = EncryptedSnapshotStore::new(delegate.clone(), "123");

        let mut sink = create(&store);
        let mut buf = b"Hello World!".to_vec();
        assert_eq!(sink.write_in_place(&mut buf).unwrap(), 12);
        assert_ne!(buf, b"Hello World!");
        sink.close().unwrap();

        let (_, mut reader) = store.open("1-10-0").unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"Hello World!");
    }

    #[test]
    fn test_per_snapshot_key_differs_from_token_key() {
        let delegate = MemoryStore::default();
        let store = EncryptedSnapshotStore::with_derivation(
            delegate.clone(),
            "123",
            KeyDerivation::PerSnapshot,
        );

        let mut sink = create(&store);
        sink.write_all(b"payload").unwrap();
        sink.close().unwrap();

        let (_, mut reader) = store.open("1-10-0").unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"payload");

        let token_only = EncryptedSnapshotStore::new(delegate, "123");
        let (_, mut reader) = token_only.open("1-10-0").unwrap();
        let mut garbled = Vec::new();
        reader.read_to_end(&mut garbled).unwrap();
        assert_ne!(garbled, b"payload");
    }

    #[test]
    fn test_list_is_passthrough() {
        let delegate = MemoryStore::default();
        let store = EncryptedSnapshotStore::new(delegate.clone(), "123");
        assert_eq!(store.list().unwrap(), delegate.list().unwrap());
    }

    #[test]
    fn test_delegate_errors_propagate() {
        let store = EncryptedSnapshotStore::new(FailingStore, "123");
        assert!(matches!(
            store.create(SnapshotVersion::MAX, 1, 1, StoredMembership::default()),
            Err(SnapshotError::InvalidArgument(_))
        ));
        assert!(matches!(store.open("x"), Err(SnapshotError::NotFound(_))));
    }

    #[test]
    fn test_truncated_payload_is_crypto_error() {
        let delegate = MemoryStore::default();
        delegate.written.lock().unwrap().extend_from_slice(&[1, 2, 3]);
        let store = EncryptedSnapshotStore::new(delegate, "123");
        assert!(matches!(store.open("1-10-0"), Err(SnapshotError::Crypto(_))));
    }

    #[test]
    fn test_failed_iv_write_cancels_delegate_sink() {
        let dir = tempfile::tempdir().unwrap();
        let file_store = crate::file::FileSnapshotStore::new(dir.path(), 2).unwrap();
        let store = EncryptedSnapshotStore::new(BrokenDiskStore(file_store), "123");

        for index in 1..=3 {
            let result = store.create(SnapshotVersion::MAX, index, 1, StoredMembership::default());
            assert!(matches!(result, Err(SnapshotError::Crypto(_))));
        }

        // no in-progress directories are left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_debug_hides_token() {
        let store = EncryptedSnapshotStore::new(MemoryStore::default(), "super-secret");
        assert!(!format!("{:?}", store).contains("super-secret"));
    }
}
