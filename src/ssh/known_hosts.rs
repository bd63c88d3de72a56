//! Known hosts verification
//!
//! Reads and appends an OpenSSH `known_hosts` file. Hashed hostnames
//! (`|1|...`) are ignored. One store is built per connector; there is no
//! process-wide instance.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::SshError;

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches a known_hosts entry
    Verified,
    /// No entry for this host and key type
    Unknown { fingerprint: String },
    /// Key differs from the recorded one
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// known_hosts file with an in-memory index
pub struct KnownHostsStore {
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    path: PathBuf,
}

impl KnownHostsStore {
    /// `~/.ssh/known_hosts`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from(".ssh/known_hosts"))
    }

    /// Load from `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let store = Self {
            hosts: RwLock::new(HashMap::new()),
            path: path.into(),
        };

        if let Err(e) = store.load() {
            warn!("Failed to load known_hosts {:?}: {}", store.path, e);
        }

        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<(), SshError> {
        if !self.path.exists() {
            debug!("No known_hosts file at {:?}", self.path);
            return Ok(());
        }

        let reader = BufReader::new(fs::File::open(&self.path)?);
        let mut hosts = self.hosts.write();
        let mut entry_count = 0;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // hostname[,alias...] keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }

            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for hostname in parts[0].split(',') {
                if hostname.starts_with('|') {
                    continue;
                }
                hosts
                    .entry(hostname.to_lowercase())
                    .or_default()
                    .push(entry.clone());
                entry_count += 1;
            }
        }

        info!(
            "Loaded {} known host entries ({} unique hosts)",
            entry_count,
            hosts.len()
        );
        Ok(())
    }

    /// Lookup key in known_hosts notation: `host` or `[host]:port`
    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// `SHA256:...` fingerprint as printed by `ssh-keygen -l`
    pub fn fingerprint(key: &PublicKey) -> String {
        fingerprint_bytes(&key.public_key_bytes())
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let actual_b64 = BASE64.encode(key.public_key_bytes());
        let actual_type = key.algorithm().as_str().to_string();
        let fingerprint = Self::fingerprint(key);

        let hosts = self.hosts.read();
        let Some(entries) = hosts.get(&lookup_key) else {
            debug!("Unknown host: {}", lookup_key);
            return HostKeyVerification::Unknown { fingerprint };
        };

        match entries.iter().find(|e| e.key_type == actual_type) {
            Some(entry) if entry.key_data == actual_b64 => {
                debug!("Host key verified for {} ({})", lookup_key, actual_type);
                HostKeyVerification::Verified
            }
            Some(entry) => {
                let expected_fingerprint = BASE64
                    .decode(&entry.key_data)
                    .map(|bytes| fingerprint_bytes(&bytes))
                    .unwrap_or_else(|_| "unknown".to_string());
                warn!(
                    "HOST KEY CHANGED for {} ({})! Expected {}, got {}",
                    lookup_key, actual_type, expected_fingerprint, fingerprint
                );
                HostKeyVerification::Changed {
                    expected_fingerprint,
                    actual_fingerprint: fingerprint,
                }
            }
            None => {
                // Known host, new key type
                debug!("Host {} has no {} key recorded", lookup_key, actual_type);
                HostKeyVerification::Unknown { fingerprint }
            }
        }
    }

    /// Record a host key and append it to the file
    pub fn add_host(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        let lookup_key = Self::make_key(host, port);
        let key_data = BASE64.encode(key.public_key_bytes());
        let key_type = key.algorithm().as_str().to_string();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{} {} {}", lookup_key, key_type, key_data)?;

        self.hosts
            .write()
            .entry(lookup_key.clone())
            .or_default()
            .push(HostKeyEntry { key_type: key_type.clone(), key_data });

        info!("Added host key for {} ({}) to known_hosts", lookup_key, key_type);
        Ok(())
    }

    /// Forget every key for a host, rewriting the file
    pub fn remove_host(&self, host: &str, port: u16) -> Result<(), SshError> {
        let lookup_key = Self::make_key(host, port);
        self.hosts.write().remove(&lookup_key);

        if !self.path.exists() {
            return Ok(());
        }

        let content = fs::read_to_string(&self.path)?;
        let kept: Vec<&str> = content
            .lines()
            .filter(|line| match line.split_whitespace().next() {
                Some(names) => !names.split(',').any(|h| h.eq_ignore_ascii_case(&lookup_key)),
                None => true,
            })
            .collect();

        let mut rewritten = kept.join("\n");
        if !rewritten.is_empty() {
            rewritten.push('\n');
        }
        fs::write(&self.path, rewritten)?;

        info!("Removed host key for {} from known_hosts", lookup_key);
        Ok(())
    }
}

fn fingerprint_bytes(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use russh::keys::ssh_key::{Algorithm, HashAlg};
    use russh::keys::PrivateKey;
    use tempfile::tempdir;

    fn host_key() -> PublicKey {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .clone()
    }

    #[test]
    fn test_make_key() {
        assert_eq!(KnownHostsStore::make_key("GitHub.com", 22), "github.com");
        assert_eq!(
            KnownHostsStore::make_key("server.com", 2222),
            "[server.com]:2222"
        );
    }

    #[test]
    fn test_fingerprint_matches_ssh_key() {
        let key = host_key();
        assert_eq!(
            KnownHostsStore::fingerprint(&key),
            key.fingerprint(HashAlg::Sha256).to_string()
        );
    }

    #[test]
    fn test_unknown_then_verified_after_add() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("ssh").join("known_hosts");
        let store = KnownHostsStore::open(&path);
        let key = host_key();

        assert!(matches!(
            store.verify("example.com", 2222, &key),
            HostKeyVerification::Unknown { .. }
        ));

        store.add_host("example.com", 2222, &key).unwrap();
        assert_eq!(
            store.verify("example.com", 2222, &key),
            HostKeyVerification::Verified
        );
        // Port is part of the identity
        assert!(matches!(
            store.verify("example.com", 22, &key),
            HostKeyVerification::Unknown { .. }
        ));

        // Survives a reload
        let reloaded = KnownHostsStore::open(&path);
        assert_eq!(
            reloaded.verify("example.com", 2222, &key),
            HostKeyVerification::Verified
        );
    }

    #[test]
    fn test_changed_key_detected() {
        let temp = tempdir().unwrap();
        let store = KnownHostsStore::open(temp.path().join("known_hosts"));
        let original = host_key();
        let imposter = host_key();

        store.add_host("example.com", 22, &original).unwrap();
        match store.verify("example.com", 22, &imposter) {
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                assert_eq!(expected_fingerprint, KnownHostsStore::fingerprint(&original));
                assert_eq!(actual_fingerprint, KnownHostsStore::fingerprint(&imposter));
            }
            other => panic!("expected Changed, got {:?}", other),
        }
    }

    #[test]
    fn test_remove_host() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("known_hosts");
        let store = KnownHostsStore::open(&path);
        let key = host_key();
        let other = host_key();

        store.add_host("a.example", 22, &key).unwrap();
        store.add_host("b.example", 22, &other).unwrap();
        store.remove_host("a.example", 22).unwrap();

        let reloaded = KnownHostsStore::open(&path);
        assert!(matches!(
            reloaded.verify("a.example", 22, &key),
            HostKeyVerification::Unknown { .. }
        ));
        assert_eq!(
            reloaded.verify("b.example", 22, &other),
            HostKeyVerification::Verified
        );
    }

    #[test]
    fn test_skips_comments_and_hashed_entries() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("known_hosts");
        fs::write(
            &path,
            "# comment\n\n|1|abc=|def= ssh-ed25519 AAAA\nbroken-line\n",
        )
        .unwrap();

        let store = KnownHostsStore::open(&path);
        assert!(store.hosts.read().is_empty());
    }
}
