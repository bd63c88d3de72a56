//! SSH shell session
//!
//! A `Session` owns at most one transport + shell channel pair. The shell
//! channel itself lives in a shell owner task; the session keeps the
//! controller, the transport and the consumer side of the output queue.
//!
//! `connect()` and `disconnect()` are serialized by an async lifecycle lock,
//! so a disconnect issued while a connect is in flight waits for it to finish.
//! Remote hangups are handled by a watcher that takes the same lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::channel_owner::{spawn_shell_owner_task, ShellController, ShellExit};
use super::config::{ConnectionConfig, TerminalSize};
use super::error::{ConnectError, InputError, ResizeError, SshError};
use super::output::{line_stream, OutputReader};
use super::transport::{Connector, ShellChannel, Transport};
use crate::config::SessionSettings;
use crate::credential::CredentialStore;
use crate::session::{SessionInfo, SessionState, SessionStateMachine};

/// Handles of a connected session
#[derive(Clone)]
struct LiveShell {
    generation: u64,
    transport: Arc<dyn Transport>,
    shell: ShellController,
    output: Arc<tokio::sync::Mutex<OutputReader>>,
}

impl LiveShell {
    fn is_open(&self) -> bool {
        self.transport.is_open() && self.shell.is_alive()
    }
}

struct SessionInner {
    id: String,
    instance_id: String,
    config: ConnectionConfig,
    settings: Arc<SessionSettings>,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialStore>,
    /// Serializes connect / disconnect / remote-close teardown
    lifecycle: tokio::sync::Mutex<()>,
    state: Mutex<SessionStateMachine>,
    live: Mutex<Option<LiveShell>>,
    generation: AtomicU64,
    teardown_error: Mutex<Option<String>>,
    created_at: DateTime<Utc>,
    connected_at: Mutex<Option<DateTime<Utc>>>,
}

/// Managed interactive shell session
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialStore>,
        settings: Arc<SessionSettings>,
    ) -> Self {
        // A zero idle flush spins, zero timeouts fail every stage
        let sanitized = SessionSettings::clone(&settings).sanitized();
        let settings = if sanitized == *settings {
            settings
        } else {
            Arc::new(sanitized)
        };
        Self {
            inner: Arc::new(SessionInner {
                id: id.into(),
                instance_id: uuid::Uuid::new_v4().to_string(),
                config,
                settings,
                connector,
                credentials,
                lifecycle: tokio::sync::Mutex::new(()),
                state: Mutex::new(SessionStateMachine::new()),
                live: Mutex::new(None),
                generation: AtomicU64::new(0),
                teardown_error: Mutex::new(None),
                created_at: Utc::now(),
                connected_at: Mutex::new(None),
            }),
        }
    }

    /// Connection id this session was created for
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Unique per session object, distinguishes replacements under one id
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.lock().state()
    }

    /// First error seen while tearing the session down, if any
    pub fn last_teardown_error(&self) -> Option<String> {
        self.inner.teardown_error.lock().clone()
    }

    pub fn info(&self) -> SessionInfo {
        let config = &self.inner.config;
        let (state, in_state) = {
            let machine = self.inner.state.lock();
            (machine.state(), machine.time_in_state())
        };
        SessionInfo {
            id: self.inner.id.clone(),
            instance_id: self.inner.instance_id.clone(),
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            auth_kind: config.auth.kind(),
            state,
            secs_in_state: in_state.as_secs(),
            connected: self.is_connected(),
            created_at: self.inner.created_at,
            connected_at: *self.inner.connected_at.lock(),
        }
    }

    /// Resolve credentials, open the transport, authenticate and start a shell.
    ///
    /// Every handle acquired along the way is released before an error is
    /// returned, also when this future is dropped half way.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;

        if let Err(e) = inner.state.lock().start_connecting() {
            warn!("Session {}: connect refused: {}", inner.id, e);
            return Err(ConnectError::InvalidState(e.from));
        }

        info!(
            "Session {} connecting to {} ({} auth)",
            inner.id,
            inner.config.display_name(),
            inner.config.auth.kind()
        );

        let mut attempt = ConnectAttempt::new(inner);
        let established = attempt
            .establish()
            .await
            .and_then(|()| {
                attempt
                    .take_handles()
                    .ok_or_else(|| ConnectError::ChannelFailed("no shell channel".to_string()))
            });
        let (transport, shell) = match established {
            Ok(handles) => handles,
            Err(err) => {
                error!("Session {} connect failed: {}", inner.id, err);
                let _ = inner.state.lock().connect_failed(err.to_string());
                attempt.settle();
                attempt.release().await;
                return Err(err);
            }
        };
        attempt.settle();
        drop(attempt);
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (controller, output_rx, task) = spawn_shell_owner_task(
            shell,
            format!("session {} ({})", inner.id, inner.config.display_name()),
            inner.settings.output_queue_capacity,
        );

        *inner.live.lock() = Some(LiveShell {
            generation,
            transport,
            shell: controller,
            output: Arc::new(tokio::sync::Mutex::new(OutputReader::new(output_rx))),
        });
        *inner.connected_at.lock() = Some(Utc::now());
        let _ = inner.state.lock().connect_success();
        watch_remote_close(Arc::downgrade(inner), generation, task);

        info!("Session {} connected", inner.id);

        if let Some(command) = &inner.config.startup_command {
            debug!("Session {}: sending startup command", inner.id);
            if let Err(e) = self.send_input(command).await {
                warn!("Session {}: startup command not sent: {}", inner.id, e);
            }
        }

        Ok(())
    }

    /// Close input, then the channel, then the transport.
    ///
    /// Idempotent; a no-op on a disconnected session. Close errors are
    /// logged and the first one is kept for `last_teardown_error()`.
    pub async fn disconnect(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;

        if self.inner.state.lock().state() == SessionState::Disconnected {
            debug!("Session {} already disconnected", self.inner.id);
            return;
        }

        info!("Session {} disconnecting", self.inner.id);
        self.inner.teardown().await;
    }

    /// Live check: the transport is open and the shell owner task is running
    pub fn is_connected(&self) -> bool {
        self.inner.live_shell().is_some_and(|live| live.is_open())
    }

    /// Lines of merged stdout/stderr.
    ///
    /// One subscriber at a time; a second concurrent call gets an empty
    /// stream. A new subscription continues after the last line delivered.
    /// The stream ends at EOF, on remote close or once the session is no
    /// longer connected.
    pub fn output_stream(&self) -> BoxStream<'static, String> {
        let Some(live) = self.inner.live_shell() else {
            debug!("Session {}: output requested while not connected", self.inner.id);
            return stream::empty().boxed();
        };

        let reader = match live.output.clone().try_lock_owned() {
            Ok(reader) => reader,
            Err(_) => {
                warn!(
                    "Session {}: output stream already has a subscriber",
                    self.inner.id
                );
                return stream::empty().boxed();
            }
        };

        let session = Arc::downgrade(&self.inner);
        let generation = live.generation;
        line_stream(reader, self.inner.settings.idle_flush(), move || {
            session
                .upgrade()
                .and_then(|inner| inner.live_shell())
                .is_some_and(|live| live.generation == generation && live.is_open())
        })
    }

    /// Send `text` followed by a newline
    pub async fn send_input(&self, text: &str) -> Result<(), InputError> {
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');
        self.send_raw(line.into_bytes()).await
    }

    /// Send bytes as-is (keystrokes, control sequences)
    pub async fn send_raw(&self, data: Vec<u8>) -> Result<(), InputError> {
        let live = self
            .inner
            .live_shell()
            .filter(LiveShell::is_open)
            .ok_or(InputError::NotConnected)?;

        let limit = self.inner.settings.input_timeout();
        match timeout(limit, live.shell.write(data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                debug!("Session {}: input write failed: {}", self.inner.id, e);
                Err(InputError::NotConnected)
            }
            Err(_) => {
                warn!("Session {}: input write timed out", self.inner.id);
                Err(InputError::WriteTimeout(limit))
            }
        }
    }

    /// Send a window-change request. Succeeds without doing anything when
    /// the channel has no resize support.
    pub async fn resize(
        &self,
        cols: u32,
        rows: u32,
        width_px: u32,
        height_px: u32,
    ) -> Result<(), ResizeError> {
        let size = TerminalSize {
            cols,
            rows,
            width_px,
            height_px,
        };
        if !size.is_valid() {
            return Err(ResizeError::InvalidGeometry { cols, rows });
        }

        let live = self
            .inner
            .live_shell()
            .filter(LiveShell::is_open)
            .ok_or(ResizeError::NotConnected)?;

        if !live.shell.supports_resize() {
            debug!("Session {}: channel has no resize support", self.inner.id);
            return Ok(());
        }

        match timeout(self.inner.settings.input_timeout(), live.shell.resize(size)).await {
            Ok(Ok(())) => {
                debug!("Session {} resized to {}x{}", self.inner.id, cols, rows);
                Ok(())
            }
            Ok(Err(SshError::Disconnected)) => Err(ResizeError::NotConnected),
            Ok(Err(e)) => Err(ResizeError::Failed(e.to_string())),
            Err(_) => Err(ResizeError::Failed("window change timed out".to_string())),
        }
    }

    /// Interactive shells take commands as input; exec requests are refused
    pub async fn execute_command(&self, _command: &str) -> Result<String, ConnectError> {
        Err(ConnectError::Unsupported(
            "execute_command on an interactive shell session; use send_input".to_string(),
        ))
    }
}

impl SessionInner {
    fn live_shell(&self) -> Option<LiveShell> {
        self.live.lock().clone()
    }

    /// Caller holds the lifecycle lock
    async fn teardown(&self) {
        let live = self.live.lock().take();
        if let Err(e) = self.state.lock().start_closing() {
            debug!("Session {}: {}", self.id, e);
        }

        let mut first_error: Option<String> = None;
        if let Some(live) = live {
            // A write stuck on a dead peer must not wedge the teardown
            match timeout(self.settings.channel_timeout(), live.shell.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Session {}: shell close failed: {}", self.id, e);
                    first_error.get_or_insert_with(|| e.to_string());
                }
                Err(_) => {
                    warn!("Session {}: shell close timed out", self.id);
                    first_error.get_or_insert_with(|| "shell close timed out".to_string());
                }
            }
            if let Err(e) = live.transport.close().await {
                warn!("Session {}: transport close failed: {}", self.id, e);
                first_error.get_or_insert_with(|| e.to_string());
            }
        }

        if first_error.is_some() {
            *self.teardown_error.lock() = first_error;
        }
        *self.connected_at.lock() = None;
        let _ = self.state.lock().close_complete();
        info!("Session {} disconnected", self.id);
    }
}

/// Tear the session down when its shell owner task stops on its own
fn watch_remote_close(session: Weak<SessionInner>, generation: u64, task: JoinHandle<ShellExit>) {
    tokio::spawn(async move {
        let exit = match task.await {
            Ok(exit) => exit,
            Err(e) => {
                error!("Shell owner task failed: {}", e);
                ShellExit::Remote
            }
        };
        if exit != ShellExit::Remote {
            return;
        }

        let Some(inner) = session.upgrade() else {
            return;
        };
        let _lifecycle = inner.lifecycle.lock().await;
        let current = inner.live.lock().as_ref().map(|live| live.generation);
        if current != Some(generation) {
            // A disconnect got here first
            return;
        }

        info!("Session {}: shell closed by remote", inner.id);
        inner.teardown().await;
    });
}

/// Handles acquired by an in-flight `connect()`
///
/// Dropping an attempt before it settled (the connect future was
/// cancelled at any stage) marks the session failed. Handles still held
/// are released on a background task.
struct ConnectAttempt<'a> {
    inner: &'a SessionInner,
    transport: Option<Box<dyn Transport>>,
    shell: Option<Box<dyn ShellChannel>>,
    /// The session state already reflects the outcome
    settled: bool,
}

impl<'a> ConnectAttempt<'a> {
    fn new(inner: &'a SessionInner) -> Self {
        Self {
            inner,
            transport: None,
            shell: None,
            settled: false,
        }
    }

    fn settle(&mut self) {
        self.settled = true;
    }

    async fn establish(&mut self) -> Result<(), ConnectError> {
        let inner = self.inner;
        let config = &inner.config;
        let settings = &inner.settings;

        let identity = inner
            .credentials
            .resolve(&config.auth)
            .await
            .map_err(ConnectError::AuthResolutionFailed)?;

        let transport_timeout = settings.transport_timeout();
        let transport = match timeout(
            transport_timeout,
            inner.connector.open(&config.host, config.port),
        )
        .await
        {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => return Err(ConnectError::TransportFailed(e.to_string())),
            Err(_) => {
                return Err(ConnectError::TransportFailed(format!(
                    "connection to {}:{} timed out after {:?}",
                    config.host, config.port, transport_timeout
                )))
            }
        };
        let transport = self.transport.insert(transport);
        debug!("Session {}: transport open", inner.id);

        let auth_timeout = settings.auth_timeout();
        match timeout(auth_timeout, transport.authenticate(&config.username, &identity)).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                return Err(ConnectError::AuthRejected(format!(
                    "{} authentication for {} was rejected",
                    identity.kind(),
                    config.username
                )))
            }
            Ok(Err(e)) => return Err(ConnectError::TransportFailed(e.to_string())),
            Err(_) => {
                return Err(ConnectError::TransportFailed(format!(
                    "authentication timed out after {:?}",
                    auth_timeout
                )))
            }
        }
        drop(identity);
        debug!("Session {}: authenticated", inner.id);

        let channel_timeout = settings.channel_timeout();
        match timeout(channel_timeout, transport.open_shell(&config.pty)).await {
            Ok(Ok(shell)) => {
                self.shell = Some(shell);
                Ok(())
            }
            Ok(Err(e)) => Err(ConnectError::ChannelFailed(e.to_string())),
            Err(_) => Err(ConnectError::ChannelFailed(format!(
                "shell channel not ready after {:?}",
                channel_timeout
            ))),
        }
    }

    /// Close whatever was acquired: channel first, then transport
    async fn release(&mut self) {
        if let Some(mut shell) = self.shell.take() {
            if let Err(e) = shell.close().await {
                debug!("Session {}: releasing shell: {}", self.inner.id, e);
            }
        }
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                debug!("Session {}: releasing transport: {}", self.inner.id, e);
            }
        }
    }

    /// Hand both handles over, `None` unless `establish()` succeeded
    fn take_handles(&mut self) -> Option<(Arc<dyn Transport>, Box<dyn ShellChannel>)> {
        if self.transport.is_none() || self.shell.is_none() {
            return None;
        }
        let transport = self.transport.take()?;
        let shell = self.shell.take()?;
        Some((Arc::from(transport), shell))
    }
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!("Session {}: connect cancelled", self.inner.id);
            let _ = self.inner.state.lock().connect_failed("connect cancelled");
        }

        let shell = self.shell.take();
        let transport = self.transport.take();
        if shell.is_none() && transport.is_none() {
            return;
        }

        debug!("Session {}: releasing handles of an unfinished connect", self.inner.id);
        let id = self.inner.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Some(mut shell) = shell {
                        if let Err(e) = shell.close().await {
                            debug!("Session {}: releasing shell: {}", id, e);
                        }
                    }
                    if let Some(transport) = transport {
                        if let Err(e) = transport.close().await {
                            debug!("Session {}: releasing transport: {}", id, e);
                        }
                    }
                });
            }
            Err(_) => error!("Session {}: no runtime to release handles on", id),
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if self.live.get_mut().is_some() {
            warn!("Session {} dropped while connected", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{KeyStoreCredentials, MemoryKeyStore};
    use async_trait::async_trait;

    struct RefusingConnector;

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn open(&self, _host: &str, _port: u16) -> Result<Box<dyn Transport>, SshError> {
            Err(SshError::ConnectionFailed("connection refused".into()))
        }
    }

    fn session(config: ConnectionConfig) -> Session {
        Session::new(
            "test",
            config,
            Arc::new(RefusingConnector),
            Arc::new(KeyStoreCredentials::new(Arc::new(MemoryKeyStore::new()))),
            Arc::new(SessionSettings::default()),
        )
    }

    #[tokio::test]
    async fn test_transport_failure_marks_failed() {
        let session = session(ConnectionConfig::with_password("127.0.0.1", 22, "u", "p"));
        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, ConnectError::TransportFailed(_)));
        assert_eq!(session.state().name(), "failed");
        assert!(!session.is_connected());

        // Failed sessions are not reused
        assert!(matches!(
            session.connect().await,
            Err(ConnectError::InvalidState(SessionState::Failed(_)))
        ));

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_zero_settings_are_replaced() {
        let settings = SessionSettings {
            idle_flush_ms: 0,
            input_timeout_ms: 0,
            ..SessionSettings::default()
        };
        let session = Session::new(
            "test",
            ConnectionConfig::with_password("127.0.0.1", 22, "u", "p"),
            Arc::new(RefusingConnector),
            Arc::new(KeyStoreCredentials::new(Arc::new(MemoryKeyStore::new()))),
            Arc::new(settings),
        );
        assert_eq!(session.inner.settings.idle_flush_ms, 100);
        assert_eq!(session.inner.settings.input_timeout_ms, 2_000);
    }

    #[tokio::test]
    async fn test_missing_key_fails_before_transport() {
        let session = session(ConnectionConfig::with_key("127.0.0.1", 22, "u", "missing"));
        let err = session.connect().await.unwrap_err();
        assert!(err.is_key_not_found());
        assert!(err.to_string().contains("Key not found: missing"));
    }

    #[tokio::test]
    async fn test_operations_on_disconnected_session() {
        let session = session(ConnectionConfig::with_password("127.0.0.1", 22, "u", "p"));
        assert_eq!(session.send_input("ls").await, Err(InputError::NotConnected));
        assert_eq!(
            session.resize(0, 24, 0, 0).await,
            Err(ResizeError::InvalidGeometry { cols: 0, rows: 24 })
        );
        assert_eq!(session.resize(80, 24, 0, 0).await, Err(ResizeError::NotConnected));
        assert!(matches!(
            session.execute_command("uptime").await,
            Err(ConnectError::Unsupported(_))
        ));

        let lines: Vec<String> = session.output_stream().collect().await;
        assert!(lines.is_empty());

        session.disconnect().await;
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
    }
}
