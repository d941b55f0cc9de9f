//! Durable key-value storage for the registry's snapshots.
//!
//! The store deals in opaque blobs so the registry owns its own
//! serialization format. Each key is independently loadable and
//! removable, which is what lets "clear cached data" wipe event state
//! while leaving the subscribed-channel list on disk.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use directories::ProjectDirs;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no state directory available on this platform")]
    NoStateDir,
    #[error("storage backend rejected the write")]
    WriteRejected,
}

pub trait StateStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// One file per key under a state directory. Writes go through a
/// temp file and a rename so a crash mid-write never leaves a
/// truncated blob behind.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Platform default state directory, e.g.
    /// `~/.local/share/vigil` on Linux.
    pub fn default_dir() -> Result<PathBuf, StoreError> {
        let dirs = ProjectDirs::from("io", "vigil", "vigil").ok_or(StoreError::NoStateDir)?;
        Ok(dirs.data_local_dir().to_path_buf())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl StateStore for FileStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key);
        // Unique temp names keep concurrent saves of one key from
        // tearing each other's file between create and rename.
        let tmp = self.dir.join(format!("{key}.json.{}.tmp", Uuid::new_v4()));
        if let Err(err) = write_then_swap(&tmp, &path, bytes) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        debug!(target = "vigil::storage", key, bytes = bytes.len(), "saved blob");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn write_then_swap(tmp: &Path, dest: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(tmp, dest)
}

/// In-memory store for tests and ephemeral embedding. Writes can be
/// forced to fail to exercise the retry path.
#[derive(Default)]
pub struct MemoryStore {
    entries: parking_lot::Mutex<HashMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
    write_count: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Successful saves so far; lets tests assert that a flush was (or
    /// was not) attempted.
    pub fn write_count(&self) -> usize {
        self.write_count.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl StateStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::WriteRejected);
        }
        self.entries.lock().insert(key.to_string(), bytes.to_vec());
        self.write_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::WriteRejected);
        }
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("vigil-store-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn file_store_round_trip() {
        let dir = scratch_dir();
        let store = FileStore::new(&dir).expect("create store");
        assert_eq!(store.load("channels").expect("load"), None);

        store.save("channels", b"[\"a\"]").expect("save");
        assert_eq!(
            store.load("channels").expect("load"),
            Some(b"[\"a\"]".to_vec())
        );

        store.save("channels", b"[\"a\",\"b\"]").expect("overwrite");
        assert_eq!(
            store.load("channels").expect("load"),
            Some(b"[\"a\",\"b\"]".to_vec())
        );

        store.remove("channels").expect("remove");
        assert_eq!(store.load("channels").expect("load"), None);
        // Removing a missing key is not an error.
        store.remove("channels").expect("remove again");

        fs::remove_dir_all(&dir).expect("cleanup");
    }

    #[test]
    fn file_store_leaves_no_temp_files() {
        let dir = scratch_dir();
        let store = FileStore::new(&dir).expect("create store");
        store.save("events", b"{}").expect("save");
        let leftovers: Vec<_> = fs::read_dir(&dir)
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
        fs::remove_dir_all(&dir).expect("cleanup");
    }

    #[test]
    fn memory_store_failure_toggle() {
        let store = MemoryStore::new();
        store.save("saved", b"1").expect("save");
        store.fail_writes(true);
        assert!(store.save("saved", b"2").is_err());
        assert_eq!(store.load("saved").expect("load"), Some(b"1".to_vec()));
        store.fail_writes(false);
        store.save("saved", b"2").expect("save after recovery");
        assert_eq!(store.load("saved").expect("load"), Some(b"2".to_vec()));
    }
}
