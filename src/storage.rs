//! Pluggable byte-blob persistence for raft state and snapshots.
//!
//! Grounded on `original_source/raft/storage.go`'s `Storage` interface
//! (`Save`, `ReadRaftState`, `ReadSnapshot`, `RaftStateSize`) and on the
//! bincode-to-disk pattern in the source repository's
//! `RaftNode::persist_state_to_disk` / `load_state_from_disk`.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

/// Durable storage for one raft node's state blob and snapshot blob.
///
/// Both blobs are opaque to this trait; `Raft` decides what goes in them.
/// Implementations must make `save` atomic with respect to a crash at the
/// granularity of a whole blob: a reader must never observe a half-written
/// blob.
pub trait Storage: Send + Sync {
    /// Persist either blob. `None` means "leave this blob unchanged".
    fn save(&self, state: Option<&[u8]>, snapshot: Option<&[u8]>) -> io::Result<()>;

    /// The last fully persisted state blob, or empty if none has been saved.
    fn read_state(&self) -> Vec<u8>;

    /// The last fully persisted snapshot blob, or empty if none has been saved.
    fn read_snapshot(&self) -> Vec<u8>;

    /// Byte length of the current state blob; used as a snapshot trigger.
    fn state_size(&self) -> usize;
}

/// Volatile, in-memory `Storage`. Never fails; state is lost on process exit.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    state: Vec<u8>,
    snapshot: Vec<u8>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn save(&self, state: Option<&[u8]>, snapshot: Option<&[u8]>) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = state {
            inner.state = state.to_vec();
        }
        if let Some(snapshot) = snapshot {
            inner.snapshot = snapshot.to_vec();
        }
        Ok(())
    }

    fn read_state(&self) -> Vec<u8> {
        self.inner.lock().unwrap().state.clone()
    }

    fn read_snapshot(&self) -> Vec<u8> {
        self.inner.lock().unwrap().snapshot.clone()
    }

    fn state_size(&self) -> usize {
        self.inner.lock().unwrap().state.len()
    }
}

/// Filesystem-backed `Storage`. One state file and one snapshot file per
/// node, written with plain `std::fs::write` (whole-file replace).
pub struct FileStorage {
    state_path: PathBuf,
    snapshot_path: PathBuf,
    // Serializes writers; readers just hit the filesystem. Matches the
    // source's per-storage mutex guarding both files together.
    lock: Mutex<()>,
}

impl FileStorage {
    /// `dir` is created if missing. Files are named `raft-<node_id>-state.bin`
    /// and `raft-<node_id>-snap.bin`, matching `original_source`'s layout.
    pub fn new(dir: impl Into<PathBuf>, node_id: usize) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            state_path: dir.join(format!("raft-{node_id}-state.bin")),
            snapshot_path: dir.join(format!("raft-{node_id}-snap.bin")),
            lock: Mutex::new(()),
        })
    }
}

impl Storage for FileStorage {
    fn save(&self, state: Option<&[u8]>, snapshot: Option<&[u8]>) -> io::Result<()> {
        let _guard = self.lock.lock().unwrap();
        if let Some(state) = state {
            fs::write(&self.state_path, state)?;
        }
        if let Some(snapshot) = snapshot {
            fs::write(&self.snapshot_path, snapshot)?;
        }
        Ok(())
    }

    fn read_state(&self) -> Vec<u8> {
        fs::read(&self.state_path).unwrap_or_default()
    }

    fn read_snapshot(&self) -> Vec<u8> {
        fs::read(&self.snapshot_path).unwrap_or_default()
    }

    fn state_size(&self) -> usize {
        fs::metadata(&self.state_path).map(|m| m.len() as usize).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_storage_round_trips() {
        let s = MemoryStorage::new();
        assert!(s.read_state().is_empty());
        s.save(Some(b"term=1"), None).unwrap();
        assert_eq!(s.read_state(), b"term=1");
        assert!(s.read_snapshot().is_empty());
        s.save(None, Some(b"snap")).unwrap();
        assert_eq!(s.read_state(), b"term=1", "unrelated blob untouched");
        assert_eq!(s.read_snapshot(), b"snap");
        assert_eq!(s.state_size(), 6);
    }

    #[test]
    fn file_storage_round_trips_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let fs1 = FileStorage::new(dir.path(), 0).unwrap();
        fs1.save(Some(b"hello"), Some(b"snapshot-bytes")).unwrap();
        assert_eq!(fs1.state_size(), 5);

        let fs2 = FileStorage::new(dir.path(), 0).unwrap();
        assert_eq!(fs2.read_state(), b"hello");
        assert_eq!(fs2.read_snapshot(), b"snapshot-bytes");
    }

    #[test]
    fn missing_files_read_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let fs = FileStorage::new(dir.path(), 7).unwrap();
        assert!(fs.read_state().is_empty());
        assert!(fs.read_snapshot().is_empty());
        assert_eq!(fs.state_size(), 0);
    }
}
