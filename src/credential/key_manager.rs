//! SSH key pair management
//!
//! Generates key pairs into a `KeyStore` and exports public halves in
//! OpenSSH `authorized_keys` format.

use std::sync::Arc;

use rand::rngs::OsRng;
use russh::keys::ssh_key::{Algorithm, EcdsaCurve};
use russh::keys::PrivateKey;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::key_store::{KeyInfo, KeyStore};
use super::CredentialError;

/// Supported key algorithms for generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAlgorithm {
    Ed25519,
    EcdsaP256,
}

impl KeyAlgorithm {
    pub fn display_name(&self) -> &'static str {
        match self {
            KeyAlgorithm::Ed25519 => "Ed25519",
            KeyAlgorithm::EcdsaP256 => "ECDSA P-256",
        }
    }

    fn ssh_algorithm(&self) -> Algorithm {
        match self {
            KeyAlgorithm::Ed25519 => Algorithm::Ed25519,
            KeyAlgorithm::EcdsaP256 => Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP256,
            },
        }
    }
}

/// Key pair lifecycle on top of a `KeyStore`
#[derive(Clone)]
pub struct KeyManager {
    store: Arc<dyn KeyStore>,
}

impl KeyManager {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<dyn KeyStore> {
        self.store.clone()
    }

    /// Generate a key pair under `alias`, replacing any existing key
    pub fn generate(&self, alias: &str, algorithm: KeyAlgorithm) -> Result<KeyInfo, CredentialError> {
        validate_alias(alias)?;

        info!(
            "Generating {} key pair with alias: {}",
            algorithm.display_name(),
            alias
        );

        let key = PrivateKey::random(&mut OsRng, algorithm.ssh_algorithm()).map_err(|e| {
            CredentialError::InvalidKey {
                alias: alias.to_string(),
                reason: format!("key generation failed: {}", e),
            }
        })?;

        if self.store.delete(alias)? {
            warn!("Replaced existing key with alias: {}", alias);
        }

        self.store.store(alias, &key)
    }

    /// Public key as an `authorized_keys` line
    pub fn public_key_openssh(
        &self,
        alias: &str,
        comment: Option<&str>,
    ) -> Result<String, CredentialError> {
        let key = self
            .store
            .load(alias)?
            .ok_or_else(|| CredentialError::KeyNotFound(alias.to_string()))?;

        let encoded = key
            .public_key()
            .to_openssh()
            .map_err(|e| CredentialError::InvalidKey {
                alias: alias.to_string(),
                reason: e.to_string(),
            })?;

        // Stored keys carry no comment of their own
        let encoded = encoded.trim_end().to_string();
        match comment.map(str::trim).filter(|c| !c.is_empty()) {
            Some(comment) => Ok(format!("{} {}", encoded, comment)),
            None => Ok(encoded),
        }
    }

    /// SSH algorithm name of a stored key (`ssh-ed25519`, `ssh-rsa`, ...)
    pub fn key_algorithm(&self, alias: &str) -> Result<String, CredentialError> {
        self.store
            .load(alias)?
            .map(|key| key.algorithm().as_str().to_string())
            .ok_or_else(|| CredentialError::KeyNotFound(alias.to_string()))
    }

    pub fn delete(&self, alias: &str) -> Result<bool, CredentialError> {
        let deleted = self.store.delete(alias)?;
        if deleted {
            info!("Deleted key with alias: {}", alias);
        }
        Ok(deleted)
    }

    pub fn exists(&self, alias: &str) -> Result<bool, CredentialError> {
        self.store.exists(alias)
    }

    pub fn list(&self) -> Result<Vec<KeyInfo>, CredentialError> {
        self.store.list()
    }
}

fn validate_alias(alias: &str) -> Result<(), CredentialError> {
    if alias.is_empty() || alias.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(CredentialError::InvalidKey {
            alias: alias.to_string(),
            reason: "alias must be non-empty and contain no whitespace".to_string(),
        });
    }
    Ok(())
}
