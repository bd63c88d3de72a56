//! Logging setup
//!
//! The crate only emits `tracing` events. Binaries and tests that want them
//! printed call `init_logging()` once.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a fmt subscriber filtered by `RUST_LOG`, defaulting to `info`.
///
/// Does nothing if a global subscriber is already set.
pub fn init_logging() {
    init_logging_with_default("info");
}

/// Same as `init_logging`, with a custom fallback filter
pub fn init_logging_with_default(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    if tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already installed");
    }
}
