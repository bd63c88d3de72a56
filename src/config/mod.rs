//! Configuration Management Module
//!
//! Session settings persisted as JSON, and the OS keychain key store.

#[cfg(feature = "keychain")]
pub mod keychain;
pub mod settings;
pub mod storage;

#[cfg(feature = "keychain")]
pub use keychain::KeychainKeyStore;
pub use settings::{HostKeyPolicy, SessionSettings, DEFAULT_MAX_SESSIONS, SETTINGS_VERSION};
pub use storage::{config_dir, settings_file, SettingsStorage, StorageError};
