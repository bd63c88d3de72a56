//! Key storage backends

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use russh::keys::ssh_key::HashAlg;
use russh::keys::PrivateKey;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::CredentialError;

/// Metadata describing a stored key pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub alias: String,
    /// SSH algorithm name, e.g. `ssh-ed25519`
    pub algorithm: String,
    /// `SHA256:...` fingerprint of the public half
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

impl KeyInfo {
    pub fn describe(alias: &str, key: &PrivateKey, created_at: DateTime<Utc>) -> Self {
        Self {
            alias: alias.to_string(),
            algorithm: key.algorithm().as_str().to_string(),
            fingerprint: key.public_key().fingerprint(HashAlg::Sha256).to_string(),
            created_at,
        }
    }
}

/// Storage for named key pairs
///
/// Implementations may block (OS keychain IPC); async callers go through
/// `spawn_blocking`.
pub trait KeyStore: Send + Sync {
    /// Load a key pair, `None` if the alias is unknown
    fn load(&self, alias: &str) -> Result<Option<PrivateKey>, CredentialError>;

    /// Store a key pair, replacing any existing entry for `alias`
    fn store(&self, alias: &str, key: &PrivateKey) -> Result<KeyInfo, CredentialError>;

    /// Delete a key pair. Returns whether an entry existed.
    fn delete(&self, alias: &str) -> Result<bool, CredentialError>;

    fn exists(&self, alias: &str) -> Result<bool, CredentialError> {
        Ok(self.load(alias)?.is_some())
    }

    /// All stored keys, newest first
    fn list(&self) -> Result<Vec<KeyInfo>, CredentialError>;
}

/// In-process key store
#[derive(Default)]
pub struct MemoryKeyStore {
    entries: RwLock<HashMap<String, (PrivateKey, KeyInfo)>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn load(&self, alias: &str) -> Result<Option<PrivateKey>, CredentialError> {
        Ok(self.entries.read().get(alias).map(|(key, _)| key.clone()))
    }

    fn store(&self, alias: &str, key: &PrivateKey) -> Result<KeyInfo, CredentialError> {
        let info = KeyInfo::describe(alias, key, Utc::now());
        self.entries
            .write()
            .insert(alias.to_string(), (key.clone(), info.clone()));
        debug!("Stored key '{}' ({})", alias, info.algorithm);
        Ok(info)
    }

    fn delete(&self, alias: &str) -> Result<bool, CredentialError> {
        Ok(self.entries.write().remove(alias).is_some())
    }

    fn exists(&self, alias: &str) -> Result<bool, CredentialError> {
        Ok(self.entries.read().contains_key(alias))
    }

    fn list(&self) -> Result<Vec<KeyInfo>, CredentialError> {
        let mut keys: Vec<KeyInfo> = self
            .entries
            .read()
            .values()
            .map(|(_, info)| info.clone())
            .collect();
        sort_newest_first(&mut keys);
        Ok(keys)
    }
}

pub(crate) fn sort_newest_first(keys: &mut [KeyInfo]) {
    keys.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.alias.cmp(&b.alias)));
}
