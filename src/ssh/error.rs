//! SSH Error types

use std::time::Duration;

use thiserror::Error;

use crate::credential::CredentialError;
use crate::session::SessionState;

/// Transport-level failure reported by a `Connector`, `Transport` or
/// `ShellChannel` implementation
#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Disconnected")]
    Disconnected,
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

/// Why `connect()` did not produce a live shell
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The credential could not be turned into an identity (e.g. deleted key)
    #[error("Credential resolution failed: {0}")]
    AuthResolutionFailed(#[source] CredentialError),

    /// DNS, TCP, handshake failure or timeout. Retryable.
    #[error("Transport failed: {0}")]
    TransportFailed(String),

    /// The server refused the identity. Retrying needs new credentials.
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// Shell channel could not be opened after authentication. Retryable.
    #[error("Shell channel failed: {0}")]
    ChannelFailed(String),

    /// Operation not valid for an interactive shell session
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Cannot connect a session that is {0}")]
    InvalidState(SessionState),

    #[error("Session limit reached: {current}/{max} sessions connected")]
    LimitReached { current: usize, max: usize },
}

impl ConnectError {
    /// The referenced key did not exist at resolution time
    pub fn is_key_not_found(&self) -> bool {
        matches!(
            self,
            ConnectError::AuthResolutionFailed(CredentialError::KeyNotFound(_))
        )
    }

    /// Worth retrying with the same credentials
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectError::TransportFailed(_) | ConnectError::ChannelFailed(_)
        )
    }

    /// Stable machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectError::AuthResolutionFailed(CredentialError::KeyNotFound(_)) => {
                "key_not_found"
            }
            ConnectError::AuthResolutionFailed(_) => "auth_resolution_failed",
            ConnectError::TransportFailed(_) => "transport_failed",
            ConnectError::AuthRejected(_) => "auth_rejected",
            ConnectError::ChannelFailed(_) => "channel_failed",
            ConnectError::Unsupported(_) => "unsupported",
            ConnectError::InvalidState(_) => "invalid_state",
            ConnectError::LimitReached { .. } => "limit_reached",
        }
    }
}

// Callers render these as plain messages
impl serde::Serialize for ConnectError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Input injection failure. Local and non-fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("Session not connected")]
    NotConnected,

    #[error("Write did not complete within {0:?}")]
    WriteTimeout(Duration),
}

/// Terminal resize failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResizeError {
    #[error("Invalid terminal geometry {cols}x{rows}: columns and rows must be positive")]
    InvalidGeometry { cols: u32, rows: u32 },

    #[error("Session not connected")]
    NotConnected,

    #[error("Window change failed: {0}")]
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_not_found_is_distinct() {
        let missing =
            ConnectError::AuthResolutionFailed(CredentialError::KeyNotFound("gone".into()));
        let network = ConnectError::TransportFailed("connection refused".into());

        assert!(missing.is_key_not_found());
        assert!(!network.is_key_not_found());
        assert_ne!(missing.kind(), network.kind());
        assert!(missing.to_string().contains("Key not found"));
        assert!(!missing.is_retryable());
        assert!(network.is_retryable());
    }

    #[test]
    fn test_serialize_as_message() {
        let err = ConnectError::AuthRejected("password".into());
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, "\"Authentication rejected: password\"");
    }
}
