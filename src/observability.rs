//! Tracing subscriber initialization.

use tracing_subscriber::EnvFilter;

/// Installs a formatted tracing subscriber honoring `RUST_LOG`, defaulting
/// to `info`. Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Later calls find a subscriber already installed, typically by the
    // host process or a test harness.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
