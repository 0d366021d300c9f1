//! Subscriber setup for binaries and tests.
//!
//! The runtime itself only emits `tracing` events; nothing is printed until
//! a subscriber is installed.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "tether=info";

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs a global `fmt` subscriber filtered by `RUST_LOG`.
///
/// Panics if a global subscriber is already set; use [`try_init`] where that
/// can happen (tests).
pub fn init() {
    tracing_subscriber::fmt().with_env_filter(filter()).with_target(true).init();
}

/// Like [`init`], but returns an error instead of panicking when a subscriber exists.
pub fn try_init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_test_writer()
        .try_init()
}
