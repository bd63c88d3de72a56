//! SSH client implementation using russh
//!
//! `RusshConnector` is the production `Connector`. Transports it opens hand
//! their `Handle` to a handle owner task once authenticated; shell channels
//! are plain russh `Channel`s owned by the session's bridge task.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use russh::{Channel, ChannelMsg, Pty};
use tracing::{debug, info, warn};

use super::config::{PtyConfig, TerminalMode, TerminalSize};
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use super::known_hosts::{HostKeyVerification, KnownHostsStore};
use super::transport::{ChannelEvent, Connector, ShellChannel, Transport};
use crate::config::{HostKeyPolicy, SessionSettings};
use crate::credential::AuthIdentity;

/// Resolved host key policy shared by every handler a connector creates
#[derive(Clone)]
enum HostKeyCheck {
    AcceptAll,
    KnownHosts {
        store: Arc<KnownHostsStore>,
        strict: bool,
    },
}

/// `Connector` backed by russh
pub struct RusshConnector {
    config: Arc<client::Config>,
    host_keys: HostKeyCheck,
}

impl RusshConnector {
    pub fn new(settings: &SessionSettings) -> Self {
        let config = client::Config {
            // Liveness is tracked by keepalives and the bridge task
            inactivity_timeout: None,
            keepalive_interval: settings.keepalive_interval(),
            keepalive_max: settings.keepalive_max,
            ..Default::default()
        };

        let host_keys = match &settings.host_key_policy {
            HostKeyPolicy::AcceptAll => HostKeyCheck::AcceptAll,
            HostKeyPolicy::KnownHosts { strict, path } => HostKeyCheck::KnownHosts {
                store: Arc::new(KnownHostsStore::open(
                    path.clone().unwrap_or_else(KnownHostsStore::default_path),
                )),
                strict: *strict,
            },
        };

        Self {
            config: Arc::new(config),
            host_keys,
        }
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn open(&self, host: &str, port: u16) -> Result<Box<dyn Transport>, SshError> {
        info!("Connecting to SSH server at {}:{}", host, port);

        let handler = ClientHandler {
            host: host.to_string(),
            port,
            host_keys: self.host_keys.clone(),
        };

        let handle = client::connect(self.config.clone(), (host, port), handler)
            .await
            .map_err(|e| match e {
                SshError::HostKeyRejected(_) => e,
                other => SshError::ConnectionFailed(other.to_string()),
            })?;

        debug!("SSH handshake completed with {}:{}", host, port);

        Ok(Box::new(RusshTransport {
            label: format!("{}:{}", host, port),
            handle: Some(handle),
            controller: None,
        }))
    }
}

/// Client handler for russh callbacks
pub struct ClientHandler {
    host: String,
    port: u16,
    host_keys: HostKeyCheck,
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let (store, strict) = match &self.host_keys {
            HostKeyCheck::AcceptAll => {
                debug!("Accepting host key for {}:{} without verification", self.host, self.port);
                return Ok(true);
            }
            HostKeyCheck::KnownHosts { store, strict } => (store, *strict),
        };

        match store.verify(&self.host, self.port, server_public_key) {
            HostKeyVerification::Verified => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            HostKeyVerification::Unknown { fingerprint } if strict => {
                warn!(
                    "Unknown host key for {}:{} (fingerprint: {}). Strict mode enabled, rejecting.",
                    self.host, self.port, fingerprint
                );
                Err(SshError::HostKeyRejected(format!(
                    "unknown host {}:{} ({}); add it to {:?} or disable strict mode",
                    self.host,
                    self.port,
                    fingerprint,
                    store.path()
                )))
            }
            HostKeyVerification::Unknown { fingerprint } => {
                info!(
                    "New host {}:{}, adding to known_hosts (fingerprint: {})",
                    self.host, self.port, fingerprint
                );
                if let Err(e) = store.add_host(&self.host, self.port, server_public_key) {
                    warn!("Failed to save host key: {}", e);
                }
                Ok(true)
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                // Always rejected, regardless of strict mode
                warn!(
                    "HOST KEY CHANGED for {}:{}! Expected {}, got {}",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                );
                Err(SshError::HostKeyRejected(format!(
                    "key for {}:{} has changed (expected {}, got {}); \
                     remove the old entry from {:?} if the change is legitimate",
                    self.host,
                    self.port,
                    expected_fingerprint,
                    actual_fingerprint,
                    store.path()
                )))
            }
        }
    }
}

/// russh connection
///
/// Holds the raw `Handle` until authentication succeeds, then only a
/// controller for the handle owner task.
pub struct RusshTransport {
    label: String,
    handle: Option<Handle<ClientHandler>>,
    controller: Option<HandleController>,
}

#[async_trait]
impl Transport for RusshTransport {
    async fn authenticate(
        &mut self,
        username: &str,
        identity: &AuthIdentity,
    ) -> Result<bool, SshError> {
        let handle = self.handle.as_mut().ok_or(SshError::Disconnected)?;

        let result = match identity {
            AuthIdentity::Password(password) => {
                handle
                    .authenticate_password(username, password.as_str())
                    .await?
            }
            AuthIdentity::PublicKey(key) => {
                let key_with_hash = PrivateKeyWithHashAlg::new(key.clone(), None);
                handle.authenticate_publickey(username, key_with_hash).await?
            }
        };

        if !result.success() {
            debug!("Server rejected {} authentication for {}", identity.kind(), self.label);
            return Ok(false);
        }

        info!("SSH authentication successful for {}", self.label);
        if let Some(handle) = self.handle.take() {
            self.controller = Some(spawn_handle_owner_task(handle, self.label.clone()));
        }
        Ok(true)
    }

    async fn open_shell(&self, pty: &PtyConfig) -> Result<Box<dyn ShellChannel>, SshError> {
        let controller = self
            .controller
            .as_ref()
            .ok_or_else(|| SshError::ChannelError("transport not authenticated".to_string()))?;

        let channel = controller.open_session_channel().await?;
        if let Err(e) = request_interactive_shell(&channel, pty).await {
            let _ = channel.close().await;
            return Err(e);
        }

        info!("Interactive shell started on {}", self.label);
        Ok(Box::new(RusshShell { channel }))
    }

    fn is_open(&self) -> bool {
        match (&self.controller, &self.handle) {
            (Some(controller), _) => controller.is_connected(),
            (None, Some(handle)) => !handle.is_closed(),
            (None, None) => false,
        }
    }

    async fn close(&self) -> Result<(), SshError> {
        if let Some(controller) = &self.controller {
            controller.disconnect().await;
        } else if let Some(handle) = &self.handle {
            if !handle.is_closed() {
                handle
                    .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
                    .await?;
            }
        }
        Ok(())
    }
}

fn pty_mode(mode: TerminalMode) -> Pty {
    match mode {
        TerminalMode::Echo => Pty::ECHO,
        TerminalMode::Icanon => Pty::ICANON,
        TerminalMode::Isig => Pty::ISIG,
        TerminalMode::Icrnl => Pty::ICRNL,
        TerminalMode::Onlcr => Pty::ONLCR,
    }
}

async fn request_interactive_shell(channel: &Channel<Msg>, pty: &PtyConfig) -> Result<(), SshError> {
    let modes: Vec<(Pty, u32)> = pty
        .modes
        .iter()
        .map(|&(mode, value)| (pty_mode(mode), value))
        .collect();

    channel
        .request_pty(
            false,
            &pty.term,
            pty.cols,
            pty.rows,
            pty.width_px,
            pty.height_px,
            &modes,
        )
        .await
        .map_err(|e| SshError::ChannelError(format!("PTY request failed: {}", e)))?;

    debug!("PTY allocated, sending environment");

    for (name, value) in &pty.environment() {
        // Servers silently drop variables outside AcceptEnv
        channel
            .set_env(false, name.as_str(), value.as_str())
            .await
            .map_err(|e| SshError::ChannelError(format!("env {} failed: {}", name, e)))?;
    }

    channel
        .request_shell(false)
        .await
        .map_err(|e| SshError::ChannelError(format!("Shell request failed: {}", e)))
}

/// russh session channel running an interactive shell
pub struct RusshShell {
    channel: Channel<Msg>,
}

#[async_trait]
impl ShellChannel for RusshShell {
    async fn next_event(&mut self) -> Option<ChannelEvent> {
        loop {
            match self.channel.wait().await? {
                ChannelMsg::Data { data } => return Some(ChannelEvent::Data(data.to_vec())),
                // stderr
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    return Some(ChannelEvent::Data(data.to_vec()))
                }
                ChannelMsg::Eof => return Some(ChannelEvent::Eof),
                ChannelMsg::Close => return Some(ChannelEvent::Closed),
                ChannelMsg::ExitStatus { exit_status } => {
                    info!("Remote shell exited with status {}", exit_status);
                }
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    info!("Remote shell killed by signal {:?}", signal_name);
                }
                _ => {}
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), SshError> {
        self.channel.data(data).await?;
        Ok(())
    }

    async fn window_change(&mut self, size: TerminalSize) -> Result<(), SshError> {
        self.channel
            .window_change(size.cols, size.rows, size.width_px, size.height_px)
            .await?;
        Ok(())
    }

    async fn eof(&mut self) -> Result<(), SshError> {
        self.channel.eof().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SshError> {
        self.channel.close().await?;
        Ok(())
    }
}
