use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, warn};

use super::{KeyValueStore, SessionCipher};

/// Session file name in cache directory
pub const SESSION_FILE: &str = "session.json";

/// JSON-object file store. Every mutation rewrites the whole file, which is
/// fine for the handful of keys a session holds.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    cipher: Option<SessionCipher>,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl FileStore {
    /// Open the store at `<dir>/session.json`, loading existing contents.
    pub fn open(dir: &Path, cipher: Option<SessionCipher>) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create session directory {}", dir.display()))?;
        Ok(Self::open_path(dir.join(SESSION_FILE), cipher))
    }

    /// Open a store at an explicit file path. An unreadable, corrupt or
    /// undecryptable file is treated as empty.
    pub fn open_path(path: PathBuf, cipher: Option<SessionCipher>) -> Self {
        let entries = match Self::read(&path, cipher.as_ref()) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable session file");
                BTreeMap::new()
            }
        };
        debug!(path = %path.display(), keys = entries.len(), encrypted = cipher.is_some(), "Session store opened");
        Self {
            path,
            cipher,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(path: &Path, cipher: Option<&SessionCipher>) -> Result<BTreeMap<String, Value>> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = std::fs::read_to_string(path).context("Failed to read session file")?;
        let json = match cipher {
            Some(cipher) => cipher.open(&contents)?,
            None => contents.into_bytes(),
        };
        serde_json::from_slice(&json).context("Failed to parse session file")
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Value>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, entries: &BTreeMap<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(entries)?;
        let contents = match self.cipher {
            Some(ref cipher) => cipher.seal(json.as_bytes())?,
            None => json,
        };
        std::fs::write(&self.path, contents)
            .with_context(|| format!("Failed to write session file {}", self.path.display()))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut entries = self.lock();
        entries.insert(key.to_string(), value);
        self.persist(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.lock();
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }

    /// Empties the store. Memory is only cleared once nothing is left on
    /// disk, so a failed clear can still be undone key by key.
    fn clear(&self) -> Result<()> {
        let mut entries = self.lock();
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "Failed to remove session file, overwriting it");
                self.persist(&BTreeMap::new())
                    .context("Failed to clear session file")?;
            }
        }
        entries.clear();
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::TOKEN_KEY;
    use serde_json::json;

    #[test]
    fn test_file_store_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path(), None).unwrap();
            store.set(TOKEN_KEY, json!("a.b.c")).unwrap();
            store.set("pending_reminders", json!([{"id": "r1", "at": 1}])).unwrap();
        }
        let store = FileStore::open(dir.path(), None).unwrap();
        assert_eq!(store.get_str(TOKEN_KEY).as_deref(), Some("a.b.c"));
        assert_eq!(store.get("pending_reminders"), Some(json!([{"id": "r1", "at": 1}])));
    }

    #[test]
    fn test_clear_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path(), None).unwrap();
        store.set(TOKEN_KEY, json!("a.b.c")).unwrap();
        assert!(store.path().exists());
        store.clear().unwrap();
        assert!(!store.path().exists());
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_failed_clear_keeps_entries_for_key_removal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SESSION_FILE);
        let store = FileStore::open_path(path.clone(), None);
        store.set(TOKEN_KEY, json!("a.b.c")).unwrap();

        // A directory in place of the file can be neither removed nor written
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        assert!(store.clear().is_err());
        assert_eq!(store.get_str(TOKEN_KEY).as_deref(), Some("a.b.c"));
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SESSION_FILE), "{ not json").unwrap();
        let store = FileStore::open(dir.path(), None).unwrap();
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_encrypted_store() {
        let dir = tempfile::tempdir().unwrap();
        let key = SessionCipher::generate_key();
        {
            let store = FileStore::open(dir.path(), Some(SessionCipher::new(&key))).unwrap();
            store.set(TOKEN_KEY, json!("a.b.c")).unwrap();
        }
        let raw = std::fs::read_to_string(dir.path().join(SESSION_FILE)).unwrap();
        assert!(!raw.contains("a.b.c"));

        let store = FileStore::open(dir.path(), Some(SessionCipher::new(&key))).unwrap();
        assert_eq!(store.get_str(TOKEN_KEY).as_deref(), Some("a.b.c"));

        // A different key cannot read it and starts empty
        let other = FileStore::open(dir.path(), Some(SessionCipher::new(&[9u8; 32]))).unwrap();
        assert!(other.get(TOKEN_KEY).is_none());
    }
}
