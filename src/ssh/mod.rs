//! SSH module - shell sessions over russh
//!
//! # Layout
//! - `transport`: the `Connector` / `Transport` / `ShellChannel` seam
//! - `client`: russh implementation of the seam, with known_hosts checking
//! - `handle_owner`, `channel_owner`: single-owner tasks for the russh
//!   handle and the shell channel
//! - `session`: one managed interactive shell

mod channel_owner;
mod client;
mod config;
mod error;
mod handle_owner;
pub mod known_hosts;
mod output;
mod session;
pub mod transport;

pub use client::{ClientHandler, RusshConnector};
pub use config::{ConnectionConfig, Credential, PtyConfig, TerminalMode, TerminalSize};
pub use error::{ConnectError, InputError, ResizeError, SshError};
pub use known_hosts::{HostKeyVerification, KnownHostsStore};
pub use output::LineDecoder;
pub use session::Session;
pub use transport::{ChannelEvent, Connector, ShellChannel, Transport};
