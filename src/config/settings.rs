//! Session settings

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ssh::PtyConfig;

/// Current settings file version
pub const SETTINGS_VERSION: u32 = 1;

/// Default maximum concurrently connected sessions
pub const DEFAULT_MAX_SESSIONS: usize = 20;

/// Tunables shared by every session a manager creates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub version: u32,

    /// TCP connect + SSH handshake
    pub transport_timeout_ms: u64,

    /// Authentication exchange
    pub auth_timeout_ms: u64,

    /// Session channel open + pty + shell requests
    pub channel_timeout_ms: u64,

    /// Upper bound for a single input write to reach the channel
    pub input_timeout_ms: u64,

    /// Output chunks buffered before the reader stops pulling from the channel
    pub output_queue_capacity: usize,

    /// Quiet period after which a partial line (e.g. a prompt) is emitted
    pub idle_flush_ms: u64,

    /// Maximum concurrently connected sessions per manager
    pub max_sessions: usize,

    /// SSH keepalive interval, 0 disables
    pub keepalive_interval_secs: u64,

    /// Missed keepalives before the transport is dropped
    pub keepalive_max: usize,

    /// Server host key verification
    pub host_key_policy: HostKeyPolicy,

    /// Pty used when a connection config does not override it
    pub default_pty: PtyConfig,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            transport_timeout_ms: 10_000,
            auth_timeout_ms: 10_000,
            channel_timeout_ms: 5_000,
            input_timeout_ms: 2_000,
            output_queue_capacity: 1024,
            idle_flush_ms: 100,
            max_sessions: DEFAULT_MAX_SESSIONS,
            keepalive_interval_secs: 30,
            keepalive_max: 3,
            host_key_policy: HostKeyPolicy::default(),
            default_pty: PtyConfig::default(),
        }
    }
}

impl SessionSettings {
    pub fn transport_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_timeout_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn channel_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_timeout_ms)
    }

    pub fn input_timeout(&self) -> Duration {
        Duration::from_millis(self.input_timeout_ms)
    }

    pub fn idle_flush(&self) -> Duration {
        Duration::from_millis(self.idle_flush_ms)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }

    /// Replace zero values that would wedge a session with defaults
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.transport_timeout_ms == 0 {
            self.transport_timeout_ms = defaults.transport_timeout_ms;
        }
        if self.auth_timeout_ms == 0 {
            self.auth_timeout_ms = defaults.auth_timeout_ms;
        }
        if self.channel_timeout_ms == 0 {
            self.channel_timeout_ms = defaults.channel_timeout_ms;
        }
        if self.input_timeout_ms == 0 {
            self.input_timeout_ms = defaults.input_timeout_ms;
        }
        if self.output_queue_capacity == 0 {
            self.output_queue_capacity = defaults.output_queue_capacity;
        }
        if self.idle_flush_ms == 0 {
            self.idle_flush_ms = defaults.idle_flush_ms;
        }
        if self.max_sessions == 0 {
            self.max_sessions = defaults.max_sessions;
        }
        self
    }
}

/// How server host keys are checked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Accept any host key
    AcceptAll,

    /// Verify against a known_hosts file
    /// - strict: reject unknown hosts
    /// - otherwise: record unknown hosts, still reject changed keys
    KnownHosts {
        #[serde(default)]
        strict: bool,
        /// Defaults to ~/.ssh/known_hosts
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<std::path::PathBuf>,
    },
}

impl Default for HostKeyPolicy {
    fn default() -> Self {
        HostKeyPolicy::KnownHosts {
            strict: false,
            path: None,
        }
    }
}
