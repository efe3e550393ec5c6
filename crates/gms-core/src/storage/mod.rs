//! Persisted key-value storage for session fields.
//!
//! This module provides:
//! - `KeyValueStore`: the storage seam used by the session lifecycle
//! - `MemoryStore`: in-process storage for tests and ephemeral hosts
//! - `FileStore`: a JSON file, optionally encrypted with `SessionCipher`
//!
//! Values are JSON so unrelated payloads (reminder data) survive a logout
//! byte-for-byte.

pub mod cipher;
pub mod file;

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use anyhow::Result;
use serde_json::Value;

pub use cipher::SessionCipher;
pub use file::FileStore;

/// Key holding the bearer token.
pub const TOKEN_KEY: &str = "user_token";
/// Key holding the user id decoded from the token or returned by login.
pub const USER_ID_KEY: &str = "user_id";
/// Key holding the account role.
pub const USER_TYPE_KEY: &str = "user_type";
/// Key holding the hard expiry as unix milliseconds.
pub const TOKEN_EXPIRY_KEY: &str = "token_expiry";
/// Key holding the last observed activity as unix milliseconds.
pub const LAST_ACTIVITY_KEY: &str = "last_activity";

/// A process-wide key-value store. Implementations use interior mutability
/// so one store can be shared behind an `Arc`.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    fn set(&self, key: &str, value: Value) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    fn clear(&self) -> Result<()>;

    fn keys(&self) -> Vec<String>;

    fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_string))
    }

    fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.as_i64())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}
