//! Transport seam
//!
//! A `Session` only talks to the SSH library through these traits. The
//! production implementation lives in `client`; tests plug in fakes.
//!
//! Lifecycle of the handles a connect attempt acquires:
//!
//! ```text
//! Connector::open ──▶ Transport ──authenticate──▶ open_shell ──▶ ShellChannel
//! ```
//!
//! Every `Transport` returned by `open` must eventually see `close()`, and
//! every `ShellChannel` returned by `open_shell` must eventually see
//! `close()`, whether or not the connect attempt succeeded.

use async_trait::async_trait;

use super::config::{PtyConfig, TerminalSize};
use super::error::SshError;
use crate::credential::AuthIdentity;

/// Event read from a shell channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Remote output, stdout and stderr merged
    Data(Vec<u8>),
    /// Remote side finished sending
    Eof,
    /// Channel closed by the remote side
    Closed,
}

/// Opens transports to remote hosts
#[async_trait]
pub trait Connector: Send + Sync {
    /// TCP connect + SSH handshake (including host key verification)
    async fn open(&self, host: &str, port: u16) -> Result<Box<dyn Transport>, SshError>;
}

/// One SSH connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Returns `Ok(false)` when the server rejects the identity
    async fn authenticate(
        &mut self,
        username: &str,
        identity: &AuthIdentity,
    ) -> Result<bool, SshError>;

    /// Open a session channel and request pty, environment and shell
    async fn open_shell(&self, pty: &PtyConfig) -> Result<Box<dyn ShellChannel>, SshError>;

    /// Live check against the underlying connection
    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), SshError>;
}

/// Interactive shell channel
///
/// Owned by a single task; not shared.
#[async_trait]
pub trait ShellChannel: Send {
    /// Next event, `None` once the channel is gone.
    /// Must be cancel safe: it is polled inside `select!`.
    async fn next_event(&mut self) -> Option<ChannelEvent>;

    async fn write(&mut self, data: &[u8]) -> Result<(), SshError>;

    async fn window_change(&mut self, size: TerminalSize) -> Result<(), SshError>;

    /// Whether `window_change` is meaningful for this channel
    fn supports_resize(&self) -> bool {
        true
    }

    /// Close our input side
    async fn eof(&mut self) -> Result<(), SshError>;

    async fn close(&mut self) -> Result<(), SshError>;
}
