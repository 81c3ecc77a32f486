//! Logging setup for molt-server.
//!
//! Both generations usually write to the same terminal during a restart, so
//! `main` wraps everything in a span carrying the process id.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,molt_ecdysis=debug,molt_server=debug";

/// Initialize the global subscriber.
///
/// # Configuration
///
/// - `RUST_LOG`: log filter (default: `info,molt_ecdysis=debug,molt_server=debug`)
/// - `json`: emit one JSON object per line instead of human-readable output
pub fn init(json: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(filter);

    if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true);
        registry.with(fmt_layer).try_init()?;
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true);
        registry.with(fmt_layer).try_init()?;
    }

    tracing::debug!(json, "Telemetry initialized");

    Ok(())
}
