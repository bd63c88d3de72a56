//! Scripted in-process SSH transport for integration tests
//!
//! The fake shell prints a banner and a `$ ` prompt, then understands a few
//! commands:
//!
//! - `echo X` prints `X`
//! - `seq N` prints `line-1` .. `line-N`, one chunk per line
//! - `exit` prints `logout` and sends EOF
//!
//! Every handle handed out is counted so tests can check that opens and
//! closes balance.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use oxide_session::ssh::{ChannelEvent, Connector, ShellChannel, SshError, Transport};
use oxide_session::{
    AuthIdentity, KeyStoreCredentials, MemoryKeyStore, PtyConfig, SessionSettings, TerminalSize,
};

pub const BANNER: &str = "Welcome to fake-sshd";

/// How the fake server behaves at each connect stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Stage {
    #[default]
    Ok,
    Fail,
    Hang,
}

#[derive(Debug, Clone, Default)]
pub struct Behavior {
    pub open: Stage,
    /// `Fail` means a transport error, see `reject_auth` for a refusal
    pub auth: Stage,
    pub reject_auth: bool,
    pub shell: Stage,
    /// Writes block until the transport is closed
    pub stall_writes: bool,
    pub no_resize: bool,
}

#[derive(Default)]
pub struct Counters {
    pub transports_opened: AtomicUsize,
    pub transports_closed: AtomicUsize,
    pub shells_opened: AtomicUsize,
    pub shells_closed: AtomicUsize,
    /// Data events handed to the session
    pub chunks_delivered: AtomicUsize,
    pub auth_kinds: Mutex<Vec<&'static str>>,
    pub writes: Mutex<Vec<String>>,
    pub resizes: Mutex<Vec<TerminalSize>>,
    pub ptys: Mutex<Vec<PtyConfig>>,
    remotes: Mutex<Vec<mpsc::UnboundedSender<ChannelEvent>>>,
}

impl Counters {
    pub fn transports_opened(&self) -> usize {
        self.transports_opened.load(Ordering::SeqCst)
    }

    pub fn shells_opened(&self) -> usize {
        self.shells_opened.load(Ordering::SeqCst)
    }

    pub fn chunks_delivered(&self) -> usize {
        self.chunks_delivered.load(Ordering::SeqCst)
    }

    /// Every handle that was opened has been closed
    pub fn balanced(&self) -> bool {
        self.transports_opened.load(Ordering::SeqCst) == self.transports_closed.load(Ordering::SeqCst)
            && self.shells_opened.load(Ordering::SeqCst) == self.shells_closed.load(Ordering::SeqCst)
    }

    /// Server side closes every shell opened so far
    pub fn hangup_all(&self) {
        for remote in self.remotes.lock().iter() {
            let _ = remote.send(ChannelEvent::Closed);
        }
    }
}

pub struct FakeConnector {
    behavior: Mutex<Behavior>,
    pub counters: Arc<Counters>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Self::with(Behavior::default())
    }

    pub fn with(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, _host: &str, _port: u16) -> Result<Box<dyn Transport>, SshError> {
        let behavior = self.behavior.lock().clone();
        match behavior.open {
            Stage::Ok => {}
            Stage::Fail => return Err(SshError::ConnectionFailed("connection refused".into())),
            Stage::Hang => std::future::pending::<()>().await,
        }

        self.counters.transports_opened.fetch_add(1, Ordering::SeqCst);
        let (closed_tx, _) = watch::channel(false);
        Ok(Box::new(FakeTransport {
            behavior,
            counters: self.counters.clone(),
            closed: AtomicBool::new(false),
            closed_tx,
        }))
    }
}

struct FakeTransport {
    behavior: Behavior,
    counters: Arc<Counters>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn authenticate(
        &mut self,
        _username: &str,
        identity: &AuthIdentity,
    ) -> Result<bool, SshError> {
        self.counters.auth_kinds.lock().push(identity.kind());
        match self.behavior.auth {
            Stage::Ok => Ok(!self.behavior.reject_auth),
            Stage::Fail => Err(SshError::ProtocolError("unexpected packet".into())),
            Stage::Hang => std::future::pending().await,
        }
    }

    async fn open_shell(&self, pty: &PtyConfig) -> Result<Box<dyn ShellChannel>, SshError> {
        match self.behavior.shell {
            Stage::Ok => {}
            Stage::Fail => return Err(SshError::ChannelError("administratively prohibited".into())),
            Stage::Hang => std::future::pending::<()>().await,
        }

        self.counters.shells_opened.fetch_add(1, Ordering::SeqCst);
        self.counters.ptys.lock().push(pty.clone());

        let (remote, events) = mpsc::unbounded_channel();
        let _ = remote.send(ChannelEvent::Data(format!("{}\r\n", BANNER).into_bytes()));
        let _ = remote.send(ChannelEvent::Data(b"$ ".to_vec()));
        self.counters.remotes.lock().push(remote.clone());

        Ok(Box::new(FakeShell {
            behavior: self.behavior.clone(),
            counters: self.counters.clone(),
            events,
            remote,
            transport_closed: self.closed_tx.subscribe(),
            input: String::new(),
            closed: false,
        }))
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), SshError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.counters.transports_closed.fetch_add(1, Ordering::SeqCst);
            self.closed_tx.send_replace(true);
        }
        Ok(())
    }
}

struct FakeShell {
    behavior: Behavior,
    counters: Arc<Counters>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    remote: mpsc::UnboundedSender<ChannelEvent>,
    transport_closed: watch::Receiver<bool>,
    input: String,
    closed: bool,
}

impl FakeShell {
    fn output(&self, text: impl Into<String>) {
        let _ = self.remote.send(ChannelEvent::Data(text.into().into_bytes()));
    }

    fn run(&mut self, command: &str) {
        let command = command.trim_end_matches('\r');
        if let Some(text) = command.strip_prefix("echo ") {
            self.output(format!("{}\r\n$ ", text));
        } else if let Some(n) = command.strip_prefix("seq ") {
            let n: usize = n.trim().parse().unwrap_or(0);
            for i in 1..=n {
                self.output(format!("line-{}\r\n", i));
            }
            self.output("$ ");
        } else if command == "exit" {
            self.output("logout\r\n");
            let _ = self.remote.send(ChannelEvent::Eof);
        } else if command.is_empty() {
            self.output("$ ");
        } else {
            self.output(format!("{}: command not found\r\n$ ", command));
        }
    }
}

#[async_trait]
impl ShellChannel for FakeShell {
    async fn next_event(&mut self) -> Option<ChannelEvent> {
        if self.closed {
            return None;
        }
        let event = tokio::select! {
            event = self.events.recv() => event,
            _ = self.transport_closed.wait_for(|closed| *closed) => None,
        };
        if let Some(ChannelEvent::Data(_)) = &event {
            self.counters.chunks_delivered.fetch_add(1, Ordering::SeqCst);
        }
        event
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), SshError> {
        if self.closed {
            return Err(SshError::ChannelError("channel closed".into()));
        }
        if self.behavior.stall_writes {
            let _ = self.transport_closed.wait_for(|closed| *closed).await;
            return Err(SshError::Disconnected);
        }

        let text = String::from_utf8_lossy(data).into_owned();
        self.counters.writes.lock().push(text.clone());
        self.input.push_str(&text);
        while let Some(pos) = self.input.find('\n') {
            let line: String = self.input.drain(..=pos).collect();
            self.run(line.trim_end_matches('\n'));
        }
        Ok(())
    }

    async fn window_change(&mut self, size: TerminalSize) -> Result<(), SshError> {
        self.counters.resizes.lock().push(size);
        Ok(())
    }

    fn supports_resize(&self) -> bool {
        !self.behavior.no_resize
    }

    async fn eof(&mut self) -> Result<(), SshError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SshError> {
        if !self.closed {
            self.closed = true;
            self.counters.shells_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Settings with short timeouts so failure paths run quickly
pub fn fast_settings() -> SessionSettings {
    SessionSettings {
        transport_timeout_ms: 300,
        auth_timeout_ms: 300,
        channel_timeout_ms: 300,
        input_timeout_ms: 200,
        idle_flush_ms: 30,
        ..SessionSettings::default()
    }
}

pub fn key_store() -> (Arc<MemoryKeyStore>, Arc<KeyStoreCredentials>) {
    let keys = Arc::new(MemoryKeyStore::new());
    let credentials = Arc::new(KeyStoreCredentials::new(keys.clone()));
    (keys, credentials)
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Collect lines until one satisfies `done`, the stream ends or two
/// seconds pass. Prompts glued to the start of a line are stripped.
pub async fn read_until(
    stream: &mut BoxStream<'static, String>,
    mut done: impl FnMut(&str) -> bool,
) -> Vec<String> {
    let mut lines = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while let Ok(Some(line)) = tokio::time::timeout_at(deadline, stream.next()).await {
        let line = line.trim_start_matches("$ ").to_string();
        let finished = done(&line);
        lines.push(line);
        if finished {
            break;
        }
    }
    lines
}
