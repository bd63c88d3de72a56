//! Keychain Integration
//!
//! Stores SSH private keys in the system keychain.
//! Uses the `keyring` crate for cross-platform keychain access.
//!
//! The keychain cannot enumerate entries, so an index entry holding the
//! serialized `KeyInfo` list sits next to the key entries.

use keyring::Entry;
use parking_lot::Mutex;
use russh::keys::ssh_key::LineEnding;
use russh::keys::PrivateKey;

use crate::credential::key_store::sort_newest_first;
use crate::credential::{CredentialError, KeyInfo, KeyStore};

/// Service name for keychain entries
const SERVICE_NAME: &str = "com.oxideterm.session-keys";

/// Account holding the key index
const INDEX_ACCOUNT: &str = "key-index";

/// Prefix separating key accounts from the index account
const KEY_PREFIX: &str = "key:";

/// Keychain-backed `KeyStore`
pub struct KeychainKeyStore {
    service: String,
    /// Serializes read-modify-write of the index entry
    index_lock: Mutex<()>,
}

impl KeychainKeyStore {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    /// Create with custom service name (for testing)
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            index_lock: Mutex::new(()),
        }
    }

    fn entry(&self, account: &str) -> Result<Entry, CredentialError> {
        // Explicit username keeps a stable keychain identity on macOS
        let username = whoami::username();
        Entry::new(&self.service, &format!("{}@{}", username, account)).map_err(backend)
    }

    fn key_entry(&self, alias: &str) -> Result<Entry, CredentialError> {
        self.entry(&format!("{}{}", KEY_PREFIX, alias))
    }

    fn read_index(&self) -> Result<Vec<KeyInfo>, CredentialError> {
        match self.entry(INDEX_ACCOUNT)?.get_password() {
            Ok(json) => serde_json::from_str(&json)
                .map_err(|e| CredentialError::Backend(format!("Corrupt key index: {}", e))),
            Err(keyring::Error::NoEntry) => Ok(Vec::new()),
            Err(e) => Err(backend(e)),
        }
    }

    fn write_index(&self, keys: &[KeyInfo]) -> Result<(), CredentialError> {
        let json = serde_json::to_string(keys)
            .map_err(|e| CredentialError::Backend(e.to_string()))?;
        self.entry(INDEX_ACCOUNT)?
            .set_password(&json)
            .map_err(backend)
    }
}

impl Default for KeychainKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore for KeychainKeyStore {
    fn load(&self, alias: &str) -> Result<Option<PrivateKey>, CredentialError> {
        tracing::debug!("Keychain load: service={}, alias={}", self.service, alias);
        match self.key_entry(alias)?.get_password() {
            Ok(pem) => russh::keys::decode_secret_key(&pem, None)
                .map(Some)
                .map_err(|e| CredentialError::InvalidKey {
                    alias: alias.to_string(),
                    reason: e.to_string(),
                }),
            Err(keyring::Error::NoEntry) => {
                tracing::warn!("Keychain load: no entry for alias={}", alias);
                Ok(None)
            }
            Err(e) => {
                tracing::error!("Keychain load failed: alias={}, error={:?}", alias, e);
                Err(backend(e))
            }
        }
    }

    fn store(&self, alias: &str, key: &PrivateKey) -> Result<KeyInfo, CredentialError> {
        tracing::info!("Keychain store: service={}, alias={}", self.service, alias);
        let pem = key
            .to_openssh(LineEnding::LF)
            .map_err(|e| CredentialError::InvalidKey {
                alias: alias.to_string(),
                reason: e.to_string(),
            })?;

        self.key_entry(alias)?.set_password(&pem).map_err(|e| {
            tracing::error!("Keychain store failed: alias={}, error={:?}", alias, e);
            backend(e)
        })?;

        let info = KeyInfo::describe(alias, key, chrono::Utc::now());
        let _guard = self.index_lock.lock();
        let mut index = self.read_index()?;
        index.retain(|k| k.alias != alias);
        index.push(info.clone());
        self.write_index(&index)?;
        Ok(info)
    }

    fn delete(&self, alias: &str) -> Result<bool, CredentialError> {
        let existed = match self.key_entry(alias)?.delete_credential() {
            Ok(()) => true,
            Err(keyring::Error::NoEntry) => false, // Already deleted
            Err(e) => return Err(backend(e)),
        };

        let _guard = self.index_lock.lock();
        let mut index = self.read_index()?;
        let before = index.len();
        index.retain(|k| k.alias != alias);
        if index.len() != before {
            self.write_index(&index)?;
        }

        if existed {
            tracing::info!("Keychain delete: alias={}", alias);
        }
        Ok(existed)
    }

    fn exists(&self, alias: &str) -> Result<bool, CredentialError> {
        match self.key_entry(alias)?.get_password() {
            Ok(_) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(backend(e)),
        }
    }

    fn list(&self) -> Result<Vec<KeyInfo>, CredentialError> {
        let mut keys = self.read_index()?;
        sort_newest_first(&mut keys);
        Ok(keys)
    }
}

fn backend(err: keyring::Error) -> CredentialError {
    CredentialError::Backend(err.to_string())
}
