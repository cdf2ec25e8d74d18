// File-based snapshot store
// Each snapshot is a directory holding meta.json and state.bin; in-progress
// snapshots carry a .tmp suffix and are renamed into place on close

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use openraft::{BasicNode, StoredMembership};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use raftguard_common::NodeId;

use crate::store::{
    SnapshotError, SnapshotMeta, SnapshotReader, SnapshotResult, SnapshotSink, SnapshotStore,
    SnapshotVersion,
};

const META_FILE: &str = "meta.json";
const STATE_FILE: &str = "state.bin";
const TMP_SUFFIX: &str = ".tmp";

/// Snapshot store keeping the newest `retain` snapshots under a directory
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl FileSnapshotStore {
    /// Create a store rooted at `dir`, creating the directory if needed
    pub fn new(dir: impl Into<PathBuf>, retain: usize) -> SnapshotResult<Self> {
        if retain < 1 {
            return Err(SnapshotError::InvalidArgument(
                "must retain at least one snapshot".to_string(),
            ));
        }

        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        Ok(Self { dir, retain })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot_id(term: u64, index: u64) -> String {
        format!(
            "{}-{}-{}",
            term,
            index,
            chrono::Utc::now().timestamp_millis()
        )
    }

    fn read_meta(&self, id: &str) -> SnapshotResult<SnapshotMeta> {
        let path = self.dir.join(id).join(META_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SnapshotError::NotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Remove snapshots beyond the retention count
    fn reap(&self) -> SnapshotResult<()> {
        for meta in self.list()?.into_iter().skip(self.retain) {
            let path = self.dir.join(&meta.id);
            info!("Reaping snapshot {}", meta.id);
            fs::remove_dir_all(&path)?;
        }
        Ok(())
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn create(
        &self,
        version: SnapshotVersion,
        index: u64,
        term: u64,
        membership: StoredMembership<NodeId, BasicNode>,
    ) -> SnapshotResult<Box<dyn SnapshotSink>> {
        if !version.is_supported() {
            return Err(SnapshotError::UnsupportedVersion(version.0));
        }

        let id = Self::snapshot_id(term, index);
        let tmp_dir = self.dir.join(format!("{}{}", id, TMP_SUFFIX));
        fs::create_dir(&tmp_dir)?;

        let file = File::create(tmp_dir.join(STATE_FILE))?;
        info!("Creating new snapshot at {:?}", tmp_dir);

        Ok(Box::new(FileSnapshotSink {
            store: self.clone(),
            tmp_dir,
            meta: SnapshotMeta {
                version,
                id,
                index,
                term,
                membership,
                size: 0,
                checksum: String::new(),
            },
            writer: BufWriter::new(file),
            hasher: Sha256::new(),
        }))
    }

    fn list(&self) -> SnapshotResult<Vec<SnapshotMeta>> {
        let mut snapshots = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(TMP_SUFFIX) {
                debug!("Skipping in-progress snapshot {}", name);
                continue;
            }

            match self.read_meta(&name) {
                Ok(meta) if meta.version.is_supported() => snapshots.push(meta),
                Ok(meta) => warn!(
                    "Snapshot {} has unsupported version {}",
                    name, meta.version.0
                ),
                Err(e) => warn!("Failed to read snapshot metadata {}: {}", name, e),
            }
        }

        snapshots.sort_by(|a, b| {
            (b.term, b.index, &b.id).cmp(&(a.term, a.index, &a.id))
        });

        Ok(snapshots)
    }

    fn open(&self, id: &str) -> SnapshotResult<(SnapshotMeta, SnapshotReader)> {
        let meta = self.read_meta(id)?;
        let mut file = File::open(self.dir.join(id).join(STATE_FILE))?;

        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher)?;
        if const_hex::encode(hasher.finalize()) != meta.checksum {
            return Err(SnapshotError::ChecksumMismatch { id: id.to_string() });
        }
        file.seek(SeekFrom::Start(0))?;

        Ok((meta, Box::new(BufReader::new(file))))
    }
}

/// Sink writing `state.bin` inside the temporary snapshot directory
struct FileSnapshotSink {
    store: FileSnapshotStore,
    tmp_dir: PathBuf,
    meta: SnapshotMeta,
    writer: BufWriter<File>,
    hasher: Sha256,
}

impl Write for FileSnapshotSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.meta.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl SnapshotSink for FileSnapshotSink {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn close(self: Box<Self>) -> SnapshotResult<()> {
        let FileSnapshotSink {
            store,
            tmp_dir,
            mut meta,
            writer,
            hasher,
        } = *self;

        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        meta.checksum = const_hex::encode(hasher.finalize());
        let meta_bytes = serde_json::to_vec_pretty(&meta)?;
        let mut meta_file = File::create(tmp_dir.join(META_FILE))?;
        meta_file.write_all(&meta_bytes)?;
        meta_file.sync_all()?;

        let final_dir = store.dir.join(&meta.id);
        fs::rename(&tmp_dir, &final_dir)?;
        info!(
            "Snapshot {} complete ({} bytes, index {}, term {})",
            meta.id, meta.size, meta.index, meta.term
        );

        store.reap()
    }

    fn cancel(self: Box<Self>) -> SnapshotResult<()> {
        let FileSnapshotSink {
            tmp_dir, writer, meta, ..
        } = *self;
        drop(writer);
        debug!("Cancelling snapshot {}", meta.id);
        fs::remove_dir_all(&tmp_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Read;

    fn write_snapshot(store: &FileSnapshotStore, index: u64, term: u64, data: &[u8]) -> String {
        let mut sink = store
            .create(SnapshotVersion::MAX, index, term, StoredMembership::default())
            .unwrap();
        sink.write_all(data).unwrap();
        let id = sink.id().to_string();
        sink.close().unwrap();
        id
    }

    #[test]
    fn test_create_list_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path(), 3).unwrap();

        let id = write_snapshot(&store, 10, 2, b"state machine bytes");

        let list = store.list().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, id);
        assert_eq!(list[0].index, 10);
        assert_eq!(list[0].term, 2);
        assert_eq!(list[0].size, 19);

        let (meta, mut reader) = store.open(&id).unwrap();
        assert_eq!(meta, list[0]);
        let mut content = Vec::new();
        reader.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"state machine bytes");
    }

    #[test]
    fn test_retention_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path(), 2).unwrap();

        write_snapshot(&store, 10, 1, b"a");
        write_snapshot(&store, 20, 1, b"b");
        write_snapshot(&store, 30, 2, b"c");

        let list = store.list().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].index, 30);
        assert_eq!(list[1].index, 20);
    }

    #[test]
    fn test_cancel_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path(), 2).unwrap();

        let mut sink = store
            .create(SnapshotVersion::MAX, 5, 1, StoredMembership::default())
            .unwrap();
        sink.write_all(b"partial").unwrap();
        sink.cancel().unwrap();

        assert!(store.list().unwrap().is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_in_progress_snapshot_is_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path(), 2).unwrap();

        let mut sink = store
            .create(SnapshotVersion::MAX, 5, 1, StoredMembership::default())
            .unwrap();
        sink.write_all(b"partial").unwrap();

        assert!(store.list().unwrap().is_empty());
        sink.close().unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_tampered_state_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path(), 2).unwrap();
        let id = write_snapshot(&store, 1, 1, b"original");

        fs::write(dir.path().join(&id).join(STATE_FILE), b"tampered").unwrap();

        assert!(matches!(
            store.open(&id),
            Err(SnapshotError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_open_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path(), 2).unwrap();
        assert!(matches!(
            store.open("1-1-1"),
            Err(SnapshotError::NotFound(_))
        ));
    }

    #[test]
    fn test_invalid_arguments() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileSnapshotStore::new(dir.path(), 0).is_err());

        let store = FileSnapshotStore::new(dir.path(), 1).unwrap();
        let result = store.create(SnapshotVersion(9), 1, 1, StoredMembership::default());
        assert!(matches!(result, Err(SnapshotError::UnsupportedVersion(9))));
    }

    #[test]
    fn test_to_openraft_meta() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path(), 1).unwrap();
        let id = write_snapshot(&store, 42, 3, b"x");

        let meta = store.list().unwrap().remove(0).to_openraft();
        assert_eq!(meta.snapshot_id, id);
        let last = meta.last_log_id.unwrap();
        assert_eq!(last.index, 42);
        assert_eq!(last.leader_id.term, 3);
    }
}
