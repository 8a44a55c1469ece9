//! Durable key-value storage for snapshots
//!
//! `FileStore` writes are crash-safe: data goes to a temp file in the same
//! directory, is fsynced, renamed over the target, and the directory entry is
//! fsynced too. Cycles are serialised across processes with an advisory
//! lock on a `{key}.lock` file; the OS drops it when its holder exits, so a
//! crashed run never blocks the next one.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::SluiceError;

/// `get`/`put` by key, with read-after-write within a process
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SluiceError>;

    fn put(&self, key: &str, value: &[u8]) -> Result<(), SluiceError>;

    /// Exclusive cross-process lock on `key`, released when the guard drops
    fn lock(&self, _key: &str) -> Result<StoreLock, SluiceError> {
        Ok(StoreLock { file: None })
    }
}

/// Guard returned by [`KeyValueStore::lock`]; closing the file releases the lock
#[derive(Debug)]
pub struct StoreLock {
    file: Option<File>,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.unlock() {
                tracing::warn!(error = %e, "failed to release store lock");
            }
        }
    }
}

/// One JSON file per key under `root`
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, SluiceError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            SluiceError::storage(&root.display().to_string(), format!("cannot create store: {}", e))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn validate_key(key: &str) -> Result<(), SluiceError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !key.starts_with('.');
        if valid {
            Ok(())
        } else {
            Err(SluiceError::storage(
                key,
                "keys may only contain letters, digits, '-', '_' and '.', and must not start with '.'",
            ))
        }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", key))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.lock", key))
    }
}

/// Syncs a directory so renamed entries survive a crash
#[cfg(unix)]
fn fsync_dir(dir_path: &Path) -> io::Result<()> {
    let dir = OpenOptions::new().read(true).open(dir_path)?;
    dir.sync_all()
}

/// temp file + fsync + rename + directory fsync
fn write_atomic(path: &Path, value: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".sluice-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    temp.write_all(value)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    #[cfg(unix)]
    fsync_dir(dir)?;

    Ok(())
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SluiceError> {
        Self::validate_key(key)?;
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SluiceError::storage(key, format!("read failed: {}", e))),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), SluiceError> {
        Self::validate_key(key)?;
        write_atomic(&self.path_for(key), value)
            .map_err(|e| SluiceError::storage(key, format!("write failed: {}", e)))
    }

    fn lock(&self, key: &str) -> Result<StoreLock, SluiceError> {
        Self::validate_key(key)?;
        let path = self.lock_path(key);
        // The file itself is left in place; only the OS lock on it matters
        let mut file: File = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| SluiceError::storage(key, format!("cannot open lock file: {}", e)))?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                return Err(SluiceError::storage(
                    key,
                    format!("another reconciliation holds '{}'", path.display()),
                ));
            }
            Err(TryLockError::Error(e)) => {
                return Err(SluiceError::storage(
                    key,
                    format!("cannot lock '{}': {}", path.display(), e),
                ));
            }
        }

        // Holder pid, for diagnostics only
        if file.set_len(0).is_ok() {
            let _ = writeln!(file, "{}", std::process::id());
        }
        Ok(StoreLock { file: Some(file) })
    }
}

/// In-memory storage for tests. Not durable.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SluiceError> {
        Ok(self.lock_entries().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), SluiceError> {
        self.lock_entries().insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_store_read_after_write() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("state")).unwrap();

        assert_eq!(store.get("event_list").unwrap(), None);
        store.put("event_list", b"{\"a\":1}").unwrap();
        assert_eq!(store.get("event_list").unwrap(), Some(b"{\"a\":1}".to_vec()));

        store.put("event_list", b"{}").unwrap();
        assert_eq!(store.get("event_list").unwrap(), Some(b"{}".to_vec()));
    }

    #[test]
    fn test_file_store_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.put("events", b"[]").unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["events.json"]);
    }

    #[test]
    fn test_file_store_rejects_path_like_keys() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.put("../escape", b"x").is_err());
        assert!(store.get(".hidden").is_err());
        assert!(store.get("").is_err());
    }

    #[test]
    fn test_file_store_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let guard = store.lock("events").unwrap();
        assert!(matches!(
            store.lock("events"),
            Err(SluiceError::Storage { .. })
        ));
        assert!(store.lock("other").is_ok());

        drop(guard);
        assert!(store.lock("events").is_ok());
    }

    #[test]
    fn test_leftover_lock_file_does_not_block() {
        let dir = TempDir::new().unwrap();
        // A run killed mid-cycle leaves its lock file behind, but not its lock
        fs::write(dir.path().join("events.lock"), "4242\n").unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let guard = store.lock("events").unwrap();
        assert!(store.lock("events").is_err());
        drop(guard);
        assert!(store.lock("events").is_ok());
        assert!(dir.path().join("events.lock").exists());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").unwrap(), None);
        store.put("k", b"v").unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"v".to_vec()));
        assert!(store.lock("k").is_ok());
    }
}
