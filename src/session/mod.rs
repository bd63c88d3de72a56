//! Session Management Module
//!
//! - State machine for the session lifecycle
//! - `SessionManager`: per-id session registry with connection limiting
//! - Serializable snapshots for callers

mod manager;
mod state;
mod types;

pub use manager::SessionManager;
pub use state::{SessionState, SessionStateMachine, StateError};
pub use types::{SessionInfo, SessionStats};
