//! Tracing subscriber bootstrap.

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. `ATLAS_LOG` overrides the default
/// filter; calling twice is harmless.
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_env("ATLAS_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
