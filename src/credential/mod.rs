//! Credential resolution
//!
//! Turns a `Credential` from a connection config into an `AuthIdentity` the
//! transport can authenticate with. Key references are looked up in the
//! backing `KeyStore` every time `resolve()` is called, so a key deleted
//! between session creation and `connect()` fails the connect instead of
//! silently using stale material.

pub mod key_manager;
pub mod key_store;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::PrivateKey;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::ssh::Credential;

pub use key_manager::{KeyAlgorithm, KeyManager};
pub use key_store::{KeyInfo, KeyStore, MemoryKeyStore};

/// Credential resolution errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Invalid key '{alias}': {reason}")]
    InvalidKey { alias: String, reason: String },

    #[error("Key store error: {0}")]
    Backend(String),
}

/// Authentication material for one auth attempt
#[derive(Clone)]
pub enum AuthIdentity {
    Password(Zeroizing<String>),
    PublicKey(Arc<PrivateKey>),
}

impl AuthIdentity {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthIdentity::Password(_) => "password",
            AuthIdentity::PublicKey(_) => "publickey",
        }
    }
}

impl fmt::Debug for AuthIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthIdentity::Password(_) => f.write_str("Password(<redacted>)"),
            AuthIdentity::PublicKey(key) => {
                write!(f, "PublicKey({})", key.algorithm().as_str())
            }
        }
    }
}

/// Resolves credentials into identities
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn resolve(&self, credential: &Credential) -> Result<AuthIdentity, CredentialError>;
}

/// `CredentialStore` backed by a `KeyStore`
///
/// Holds no cache: every resolution reads the key store.
#[derive(Clone)]
pub struct KeyStoreCredentials {
    keys: Arc<dyn KeyStore>,
}

impl KeyStoreCredentials {
    pub fn new(keys: Arc<dyn KeyStore>) -> Self {
        Self { keys }
    }

    pub fn key_store(&self) -> Arc<dyn KeyStore> {
        self.keys.clone()
    }
}

#[async_trait]
impl CredentialStore for KeyStoreCredentials {
    async fn resolve(&self, credential: &Credential) -> Result<AuthIdentity, CredentialError> {
        match credential {
            Credential::Password { password } => {
                Ok(AuthIdentity::Password(Zeroizing::new(password.clone())))
            }
            Credential::KeyReference { alias } => {
                debug!("Resolving key '{}'", alias);

                // Keychain backends block on IPC
                let keys = self.keys.clone();
                let lookup_alias = alias.clone();
                let loaded = tokio::task::spawn_blocking(move || keys.load(&lookup_alias))
                    .await
                    .map_err(|e| CredentialError::Backend(format!("Key lookup task failed: {}", e)))??;

                match loaded {
                    Some(key) => Ok(AuthIdentity::PublicKey(Arc::new(key))),
                    None => {
                        warn!("Key '{}' not found in key store", alias);
                        Err(CredentialError::KeyNotFound(alias.clone()))
                    }
                }
            }
        }
    }
}
