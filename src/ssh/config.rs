//! SSH Configuration

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// SSH connection configuration
///
/// Immutable once handed to a `Session`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication reference, resolved at connect time
    pub auth: Credential,

    /// Command sent as the first input line once the shell is open
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_command: Option<String>,

    /// Reconnect hint carried from the connection registry.
    /// Stored only; nothing in this crate acts on it.
    #[serde(default)]
    pub auto_reconnect: bool,

    /// Pseudo-terminal request
    #[serde(default)]
    pub pty: PtyConfig,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>, auth: Credential) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            auth,
            startup_command: None,
            auto_reconnect: false,
            pty: PtyConfig::default(),
        }
    }

    /// Create a new config with password authentication
    pub fn with_password(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::new(host, port, username, Credential::password(password))
    }

    /// Create a new config referencing a stored key
    pub fn with_key(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        alias: impl Into<String>,
    ) -> Self {
        Self::new(host, port, username, Credential::key(alias))
    }

    pub fn startup_command(mut self, command: impl Into<String>) -> Self {
        self.startup_command = Some(command.into());
        self
    }

    pub fn pty(mut self, pty: PtyConfig) -> Self {
        self.pty = pty;
        self
    }

    /// `user@host:port`, used in logs
    pub fn display_name(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Authentication reference
///
/// Passwords are wiped from memory when the credential is dropped and are
/// never serialized back out.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    /// Password authentication
    Password {
        #[serde(skip_serializing)]
        password: String,
    },

    /// Public key authentication with a key held by the key store
    KeyReference { alias: String },
}

impl Credential {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(alias: impl Into<String>) -> Self {
        Self::KeyReference {
            alias: alias.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Credential::Password { .. } => "password",
            Credential::KeyReference { .. } => "key",
        }
    }

    /// Alias of the referenced key, if any
    pub fn key_alias(&self) -> Option<&str> {
        match self {
            Credential::KeyReference { alias } => Some(alias),
            Credential::Password { .. } => None,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password { .. } => f.write_str("Password(<redacted>)"),
            Credential::KeyReference { alias } => write!(f, "KeyReference({:?})", alias),
        }
    }
}

impl Drop for Credential {
    fn drop(&mut self) {
        if let Credential::Password { password } = self {
            password.zeroize();
        }
    }
}

/// Pseudo-terminal parameters requested with the shell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtyConfig {
    /// Terminal type (default: xterm-256color)
    #[serde(default = "default_term")]
    pub term: String,

    /// Terminal columns
    #[serde(default = "default_cols")]
    pub cols: u32,

    /// Terminal rows
    #[serde(default = "default_rows")]
    pub rows: u32,

    #[serde(default)]
    pub width_px: u32,

    #[serde(default)]
    pub height_px: u32,

    /// Environment variables sent before the shell request.
    /// Servers commonly drop variables not listed in `AcceptEnv`.
    #[serde(default = "default_env")]
    pub env: Vec<(String, String)>,

    /// Terminal modes sent with the pty request
    #[serde(default = "default_modes")]
    pub modes: Vec<(TerminalMode, u32)>,
}

/// Terminal mode opcodes understood by the pty request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TerminalMode {
    Echo,
    Icanon,
    Isig,
    Icrnl,
    Onlcr,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            term: default_term(),
            cols: default_cols(),
            rows: default_rows(),
            width_px: 0,
            height_px: 0,
            env: default_env(),
            modes: default_modes(),
        }
    }
}

impl PtyConfig {
    pub fn size(&self) -> TerminalSize {
        TerminalSize {
            cols: self.cols,
            rows: self.rows,
            width_px: self.width_px,
            height_px: self.height_px,
        }
    }

    /// Environment to send: `TERM` from `term` first, unless `env` sets it
    pub fn environment(&self) -> Vec<(String, String)> {
        let mut vars = Vec::with_capacity(self.env.len() + 1);
        if !self.env.iter().any(|(name, _)| name == "TERM") {
            vars.push(("TERM".to_string(), self.term.clone()));
        }
        vars.extend(self.env.iter().cloned());
        vars
    }
}

/// Terminal geometry carried by a window-change request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u32,
    pub rows: u32,
    pub width_px: u32,
    pub height_px: u32,
}

impl TerminalSize {
    pub fn new(cols: u32, rows: u32) -> Self {
        Self {
            cols,
            rows,
            width_px: 0,
            height_px: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.cols > 0 && self.rows > 0
    }
}

fn default_port() -> u16 {
    22
}

fn default_term() -> String {
    "xterm-256color".to_string()
}

fn default_cols() -> u32 {
    80
}

fn default_rows() -> u32 {
    24
}

fn default_env() -> Vec<(String, String)> {
    vec![("LANG".to_string(), "en_US.UTF-8".to_string())]
}

fn default_modes() -> Vec<(TerminalMode, u32)> {
    vec![
        (TerminalMode::Echo, 1),
        (TerminalMode::Icanon, 1),
        (TerminalMode::Isig, 1),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pty_modes_and_term() {
        let pty = PtyConfig::default();
        assert_eq!(
            pty.modes,
            vec![
                (TerminalMode::Echo, 1),
                (TerminalMode::Icanon, 1),
                (TerminalMode::Isig, 1)
            ]
        );
        assert_eq!(
            pty.environment(),
            vec![
                ("TERM".to_string(), "xterm-256color".to_string()),
                ("LANG".to_string(), "en_US.UTF-8".to_string()),
            ]
        );

        let custom = PtyConfig {
            env: vec![("TERM".to_string(), "vt100".to_string())],
            ..PtyConfig::default()
        };
        assert_eq!(custom.environment(), custom.env);
    }

    #[test]
    fn test_pty_modes_from_json() {
        let pty: PtyConfig =
            serde_json::from_str(r#"{ "modes": [["ECHO", 0], ["ISIG", 1]] }"#).unwrap();
        assert_eq!(pty.modes, vec![(TerminalMode::Echo, 0), (TerminalMode::Isig, 1)]);
        assert_eq!(pty.term, "xterm-256color");
    }

    #[test]
    fn test_password_is_redacted() {
        let config = ConnectionConfig::with_password("example.com", 22, "user", "hunter2");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_password_not_serialized() {
        let config = ConnectionConfig::with_password("example.com", 22, "user", "hunter2");
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(json.contains("\"type\":\"password\""));
    }

    #[test]
    fn test_deserialize_defaults() {
        let json = r#"{
            "host": "example.com",
            "username": "user",
            "auth": { "type": "key_reference", "alias": "laptop" }
        }"#;
        let config: ConnectionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, 22);
        assert_eq!(config.auth.key_alias(), Some("laptop"));
        assert_eq!(config.pty.term, "xterm-256color");
        assert_eq!(config.pty.size(), TerminalSize::new(80, 24));
        assert!(!config.auto_reconnect);
        assert!(config.startup_command.is_none());
    }

    #[test]
    fn test_terminal_size_validation() {
        assert!(TerminalSize::new(80, 24).is_valid());
        assert!(!TerminalSize::new(0, 24).is_valid());
        assert!(!TerminalSize::new(80, 0).is_valid());
    }
}
