//! Session lifecycle state machine
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──ok──▶ Connected
//!      ▲                          │                  │
//!      │                        error          disconnect() / remote close
//!      │                          ▼                  ▼
//!      └──────── Closing ◀──── Failed            Closing
//! ```
//!
//! A `Failed` session is never reconnected in place. The only way out of
//! `Failed` is through `Closing` into `Disconnected`.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Lifecycle state of a single shell session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Failed(String),
}

impl SessionState {
    /// Connecting or connected
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Connected)
    }

    /// Disconnected or failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Failed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
            SessionState::Failed(_) => "failed",
        }
    }

    /// Failure reason, if any
    pub fn reason(&self) -> Option<&str> {
        match self {
            SessionState::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Failed(reason) => write!(f, "failed ({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// Rejected state transition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid state transition: {from} -> {to}")]
pub struct StateError {
    pub from: SessionState,
    pub to: &'static str,
}

/// State machine guarding the legal lifecycle transitions
#[derive(Debug)]
pub struct SessionStateMachine {
    state: SessionState,
    entered_at: Instant,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            entered_at: Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.clone()
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Time spent in the current state
    pub fn time_in_state(&self) -> Duration {
        self.entered_at.elapsed()
    }

    /// Disconnected -> Connecting
    pub fn start_connecting(&mut self) -> Result<(), StateError> {
        match self.state {
            SessionState::Disconnected => {
                self.enter(SessionState::Connecting);
                Ok(())
            }
            _ => Err(self.reject("connecting")),
        }
    }

    /// Connecting -> Connected
    pub fn connect_success(&mut self) -> Result<(), StateError> {
        match self.state {
            SessionState::Connecting => {
                self.enter(SessionState::Connected);
                Ok(())
            }
            _ => Err(self.reject("connected")),
        }
    }

    /// Connecting -> Failed
    pub fn connect_failed(&mut self, reason: impl Into<String>) -> Result<(), StateError> {
        match self.state {
            SessionState::Connecting => {
                self.enter(SessionState::Failed(reason.into()));
                Ok(())
            }
            _ => Err(self.reject("failed")),
        }
    }

    /// Connecting | Connected | Failed -> Closing
    pub fn start_closing(&mut self) -> Result<(), StateError> {
        match self.state {
            SessionState::Connecting | SessionState::Connected | SessionState::Failed(_) => {
                self.enter(SessionState::Closing);
                Ok(())
            }
            _ => Err(self.reject("closing")),
        }
    }

    /// Closing -> Disconnected
    pub fn close_complete(&mut self) -> Result<(), StateError> {
        match self.state {
            SessionState::Closing => {
                self.enter(SessionState::Disconnected);
                Ok(())
            }
            _ => Err(self.reject("disconnected")),
        }
    }

    fn enter(&mut self, next: SessionState) {
        self.state = next;
        self.entered_at = Instant::now();
    }

    fn reject(&self, to: &'static str) -> StateError {
        StateError {
            from: self.state.clone(),
            to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut sm = SessionStateMachine::new();
        assert_eq!(sm.state(), SessionState::Disconnected);

        sm.start_connecting().unwrap();
        assert!(sm.is_active());
        sm.connect_success().unwrap();
        assert_eq!(sm.state(), SessionState::Connected);

        sm.start_closing().unwrap();
        sm.close_complete().unwrap();
        assert_eq!(sm.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_connected_cannot_reconnect_directly() {
        let mut sm = SessionStateMachine::new();
        sm.start_connecting().unwrap();
        sm.connect_success().unwrap();

        let err = sm.start_connecting().unwrap_err();
        assert_eq!(err.from, SessionState::Connected);
        assert!(sm.connect_success().is_err());
    }

    #[test]
    fn test_failed_is_not_reusable() {
        let mut sm = SessionStateMachine::new();
        sm.start_connecting().unwrap();
        sm.connect_failed("boom").unwrap();

        assert!(sm.is_terminal());
        assert_eq!(sm.state().reason(), Some("boom"));
        assert!(sm.start_connecting().is_err());

        // The only exit is through Closing
        sm.start_closing().unwrap();
        sm.close_complete().unwrap();
        assert_eq!(sm.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_time_in_state_restarts_on_transition() {
        let mut sm = SessionStateMachine::new();
        std::thread::sleep(Duration::from_millis(30));
        assert!(sm.time_in_state() >= Duration::from_millis(30));

        sm.start_connecting().unwrap();
        assert!(sm.time_in_state() < Duration::from_millis(30));

        // Rejected transitions leave the clock alone
        std::thread::sleep(Duration::from_millis(30));
        assert!(sm.close_complete().is_err());
        assert!(sm.time_in_state() >= Duration::from_millis(30));
    }

    #[test]
    fn test_closing_from_disconnected_rejected() {
        let mut sm = SessionStateMachine::new();
        assert!(sm.start_closing().is_err());
        assert!(sm.close_complete().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(SessionState::Connected.to_string(), "connected");
        assert_eq!(
            SessionState::Failed("timeout".into()).to_string(),
            "failed (timeout)"
        );
    }
}
