//! Application configuration management.
//!
//! Configuration covers the backend URL, session timing and the set of
//! persisted keys that survive a logout. It is stored at
//! `~/.config/garbage-ms/config.json` and every timing value can be
//! overridden from the environment.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "garbage-ms";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Backend used when nothing else is configured (Android emulator host alias)
const DEFAULT_BASE_URL: &str = "http://10.0.2.2:8080";

/// Tokens issued by the backend are considered valid for 30 minutes.
const DEFAULT_TOKEN_TTL_SECS: u64 = 30 * 60;

/// Idle time before the re-login prompt.
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 3600;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

pub const ENV_BASE_URL: &str = "GMS_BASE_URL";
pub const ENV_TOKEN_TTL_SECS: &str = "GMS_TOKEN_TTL_SECS";
pub const ENV_IDLE_TIMEOUT_SECS: &str = "GMS_IDLE_TIMEOUT_SECS";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub token_ttl_secs: u64,
    pub idle_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Persisted keys kept across logout (local reminder data and the like)
    pub preserved_keys: Vec<String>,
    /// Role an account must have to sign in from this client
    pub required_role: Option<String>,
    /// Encrypt the session file with a key held in the OS keychain
    pub encrypt_session: bool,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            preserved_keys: vec![
                "pending_reminders".to_string(),
                "reminder_schedule".to_string(),
                "fcm_token".to_string(),
            ],
            required_role: Some("USER".to_string()),
            encrypt_session: false,
            last_email: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply overrides from a variable lookup. Unparseable numbers are
    /// ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_BASE_URL).filter(|u| !u.trim().is_empty()) {
            self.base_url = url.trim().trim_end_matches('/').to_string();
        }
        if let Some(secs) = parse_secs(&lookup, ENV_TOKEN_TTL_SECS) {
            self.token_ttl_secs = secs;
        }
        if let Some(secs) = parse_secs(&lookup, ENV_IDLE_TIMEOUT_SECS) {
            self.idle_timeout_secs = secs;
        }
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(secs),
        _ => {
            warn!(var = key, value = %raw, "Ignoring invalid duration override");
            None
        }
    }
}
