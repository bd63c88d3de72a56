//! Session Manager
//!
//! Owns every `Session`, keyed by connection id, in a DashMap. At most one
//! session is live per id: connects and disconnects for the same id are
//! serialized by a per-id async lock, and a connected session is never
//! duplicated. Includes connection limiting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use futures_util::stream::BoxStream;
use tracing::{debug, info, warn};

use super::state::SessionState;
use super::types::{SessionInfo, SessionStats};
use crate::config::SessionSettings;
use crate::credential::CredentialStore;
use crate::ssh::{
    ConnectError, ConnectionConfig, Connector, Credential, InputError, ResizeError,
    RusshConnector, Session,
};

/// Registry of managed sessions
pub struct SessionManager {
    /// Map of connection id to session
    sessions: DashMap<String, Arc<Session>>,
    /// Per-id lock serializing connect / disconnect
    id_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialStore>,
    settings: Arc<SessionSettings>,
    /// Maximum concurrently connected sessions
    max_sessions: AtomicUsize,
    /// Connect attempts admitted but not finished
    pending: AtomicUsize,
    /// Lock for the limit check to prevent TOCTOU races between ids
    admit_lock: parking_lot::Mutex<()>,
}

impl SessionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialStore>,
        settings: SessionSettings,
    ) -> Self {
        let settings = settings.sanitized();
        Self {
            sessions: DashMap::new(),
            id_locks: DashMap::new(),
            connector,
            credentials,
            max_sessions: AtomicUsize::new(settings.max_sessions),
            pending: AtomicUsize::new(0),
            admit_lock: parking_lot::Mutex::new(()),
            settings: Arc::new(settings),
        }
    }

    /// Manager using the russh transport
    pub fn with_russh(credentials: Arc<dyn CredentialStore>, settings: SessionSettings) -> Self {
        let connector = Arc::new(RusshConnector::new(&settings));
        Self::new(connector, credentials, settings)
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Set maximum concurrently connected sessions
    pub fn set_max_sessions(&self, max: usize) {
        self.max_sessions.store(max, Ordering::SeqCst);
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions.load(Ordering::SeqCst)
    }

    /// Connect `id`, unless it is already connected.
    ///
    /// A stale (failed, closed or dropped) session under `id` is torn down
    /// and replaced by a new one. The new session stays registered when its
    /// connect fails, so `get()` reports the failure until the id is
    /// disconnected or connected again.
    pub async fn connect_with_config(
        &self,
        id: &str,
        config: ConnectionConfig,
    ) -> Result<(), ConnectError> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.get(id) {
            if existing.state() == SessionState::Connected && existing.is_connected() {
                debug!("Session {} already connected, reusing", id);
                return Ok(());
            }

            info!("Replacing stale session {} ({})", id, existing.state());
            self.sessions
                .remove_if(id, |_, s| s.instance_id() == existing.instance_id());
            existing.disconnect().await;
        }

        let _admission = self.admit(id)?;

        let session = Arc::new(Session::new(
            id,
            config,
            self.connector.clone(),
            self.credentials.clone(),
            self.settings.clone(),
        ));
        info!(
            "Creating session {}: {} (instance {})",
            id,
            session.config().display_name(),
            session.instance_id()
        );
        self.sessions.insert(id.to_string(), session.clone());

        let result = session.connect().await;
        if let Err(e) = &result {
            warn!("Session {} failed to connect ({}): {}", id, e.kind(), e);
        }
        result
    }

    /// Connect with a key held by the key store.
    ///
    /// A missing key fails with `ConnectError::AuthResolutionFailed`
    /// wrapping `CredentialError::KeyNotFound`; see
    /// `ConnectError::is_key_not_found()`.
    pub async fn connect_with_key(
        &self,
        id: &str,
        host: &str,
        port: u16,
        username: &str,
        alias: &str,
    ) -> Result<(), ConnectError> {
        let config = ConnectionConfig::new(host, port, username, Credential::key(alias))
            .pty(self.settings.default_pty.clone());
        self.connect_with_config(id, config).await
    }

    pub async fn connect_with_password(
        &self,
        id: &str,
        host: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> Result<(), ConnectError> {
        let config = ConnectionConfig::new(host, port, username, Credential::password(password))
            .pty(self.settings.default_pty.clone());
        self.connect_with_config(id, config).await
    }

    /// Disconnect and forget `id`. Returns whether a session was registered.
    pub async fn disconnect(&self, id: &str) -> bool {
        let lock = self.id_lock(id);
        let guard = lock.lock().await;

        let removed = self.sessions.remove(id);
        if let Some((_, session)) = &removed {
            session.disconnect().await;
            info!("Session {} removed", id);
        } else {
            debug!("Disconnect for unknown session {}", id);
        }

        drop(guard);
        drop(lock);
        self.id_locks
            .remove_if(id, |_, lock| Arc::strong_count(lock) == 1);

        removed.is_some()
    }

    /// Disconnect every session (for shutdown)
    pub async fn disconnect_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        info!("Disconnecting {} sessions", ids.len());
        join_all(ids.iter().map(|id| self.disconnect(id))).await;
    }

    /// Lookup without side effects
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub async fn send_input(&self, id: &str, text: &str) -> Result<(), InputError> {
        match self.get(id) {
            Some(session) => session.send_input(text).await,
            None => Err(InputError::NotConnected),
        }
    }

    pub async fn resize(
        &self,
        id: &str,
        cols: u32,
        rows: u32,
        width_px: u32,
        height_px: u32,
    ) -> Result<(), ResizeError> {
        match self.get(id) {
            Some(session) => session.resize(cols, rows, width_px, height_px).await,
            None if cols == 0 || rows == 0 => Err(ResizeError::InvalidGeometry { cols, rows }),
            None => Err(ResizeError::NotConnected),
        }
    }

    /// Output lines of `id`, `None` for an unknown id
    pub fn output_stream(&self, id: &str) -> Option<BoxStream<'static, String>> {
        self.get(id).map(|session| session.output_stream())
    }

    /// Snapshots of every session, ordered by id
    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut infos: Vec<SessionInfo> = sessions.iter().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Number of registered sessions, whatever their state
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn stats(&self) -> SessionStats {
        let mut stats = SessionStats {
            total: self.sessions.len(),
            max_sessions: self.max_sessions(),
            ..Default::default()
        };

        for entry in self.sessions.iter() {
            match entry.value().state() {
                SessionState::Connected => stats.connected += 1,
                SessionState::Connecting => stats.connecting += 1,
                SessionState::Failed(_) => stats.failed += 1,
                _ => {}
            }
        }

        stats
    }

    fn id_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.id_locks.entry(id.to_string()).or_default().clone()
    }

    /// Reserve a connect slot for `id`
    fn admit(&self, id: &str) -> Result<Admission<'_>, ConnectError> {
        let _guard = self.admit_lock.lock();

        let connected = self
            .sessions
            .iter()
            .filter(|e| e.key() != id && e.value().state() == SessionState::Connected)
            .count();
        let current = connected + self.pending.load(Ordering::SeqCst);
        let max = self.max_sessions();

        if current >= max {
            warn!("Session limit reached ({}/{}), refusing {}", current, max, id);
            return Err(ConnectError::LimitReached { current, max });
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        Ok(Admission {
            pending: &self.pending,
        })
    }
}

/// Connect slot, released when the attempt finishes or is dropped
struct Admission<'a> {
    pending: &'a AtomicUsize,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}
