//! Session snapshots

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::state::SessionState;

/// Point-in-time view of one managed session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Connection id
    pub id: String,
    /// Distinguishes successive sessions under the same id
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    /// `password` or `key`; secrets are never exposed
    pub auth_kind: &'static str,
    pub state: SessionState,
    /// Seconds since the last state change
    pub secs_in_state: u64,
    /// Live check at snapshot time
    pub connected: bool,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
}

impl SessionInfo {
    pub fn uptime_secs(&self) -> u64 {
        self.connected_at
            .map(|at| (Utc::now() - at).num_seconds().max(0) as u64)
            .unwrap_or(0)
    }
}

/// Session statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Total number of tracked sessions
    pub total: usize,
    /// Number of connected sessions
    pub connected: usize,
    /// Number of connecting sessions
    pub connecting: usize,
    /// Number of sessions whose last connect failed
    pub failed: usize,
    /// Maximum allowed concurrently connected sessions
    pub max_sessions: usize,
}
