//! oxide-session - managed SSH shell sessions
//!
//! Built on russh and tokio. A `SessionManager` keeps at most one live
//! `Session` per connection id; each session resolves its credentials at
//! connect time, bridges the remote shell into a line stream and forwards
//! input and terminal resizes.
//!
//! ```ignore
//! let keys = Arc::new(MemoryKeyStore::new());
//! let credentials = Arc::new(KeyStoreCredentials::new(keys));
//! let manager = SessionManager::with_russh(credentials, SessionSettings::default());
//!
//! manager.connect_with_password("dev", "dev.example.com", 22, "me", "secret").await?;
//! let mut lines = manager.output_stream("dev").unwrap();
//! manager.send_input("dev", "uname -a").await?;
//! while let Some(line) = lines.next().await {
//!     println!("{}", line);
//! }
//! ```

pub mod config;
pub mod credential;
pub mod logging;
pub mod session;
pub mod ssh;

pub use config::{HostKeyPolicy, SessionSettings, SettingsStorage};
pub use credential::{
    AuthIdentity, CredentialError, CredentialStore, KeyAlgorithm, KeyInfo, KeyManager,
    KeyStore, KeyStoreCredentials, MemoryKeyStore,
};
pub use logging::init_logging;
pub use session::{SessionInfo, SessionManager, SessionState, SessionStats};
pub use ssh::{
    ConnectError, ConnectionConfig, Credential, InputError, PtyConfig, ResizeError, Session,
    TerminalSize,
};
