use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use keyring::Entry;
use tracing::{debug, info};

use crate::storage::cipher::{SessionCipher, KEY_LEN};

const SERVICE_NAME: &str = "garbage-ms";

/// Keychain account under which the session-file key is stored
const STORAGE_KEY_ACCOUNT: &str = "session-store-key";

pub struct CredentialStore;

impl CredentialStore {
    /// Fetch the session-file encryption key from the OS keychain, creating
    /// and storing a fresh one on first use.
    pub fn storage_key() -> Result<[u8; KEY_LEN]> {
        let entry = Entry::new(SERVICE_NAME, STORAGE_KEY_ACCOUNT)
            .context("Failed to create keyring entry")?;

        match entry.get_password() {
            Ok(encoded) => {
                debug!("Loaded session storage key from keychain");
                Self::decode_key(&encoded)
            }
            Err(keyring::Error::NoEntry) => {
                let key = SessionCipher::generate_key();
                entry
                    .set_password(&STANDARD.encode(key))
                    .context("Failed to store session key in keychain")?;
                info!("Generated new session storage key");
                Ok(key)
            }
            Err(e) => Err(e).context("Failed to read session key from keychain"),
        }
    }

    fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN]> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .context("Stored session key is not valid base64")?;
        bytes
            .try_into()
            .map_err(|b: Vec<u8>| anyhow!("Stored session key has length {}, expected {}", b.len(), KEY_LEN))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_key() {
        let key = [7u8; KEY_LEN];
        assert_eq!(CredentialStore::decode_key(&STANDARD.encode(key)).unwrap(), key);
        assert!(CredentialStore::decode_key("c2hvcnQ=").is_err());
        assert!(CredentialStore::decode_key("%%%").is_err());
    }
}
