//! Development-time tracing for debugging the orchestrator.
//!
//! Tracing is dev diagnostics only, driven by `RUST_LOG` and written to
//! stderr. Product artifacts (task reports, agent logs) go through the
//! artifact writer and are unaffected by the filter.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; defaults to `warn` when unset. Output: stderr,
/// compact format.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
