//! Subscriber setup for binaries and tests that want to see ggrt's spans.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "warn";

/// Installs a global fmt subscriber filtered by `GGRT_LOG`, then `RUST_LOG`,
/// then `warn`. Returns `false` if a global subscriber was already set.
pub fn init_tracing() -> bool {
    let filter = std::env::var("GGRT_LOG")
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
