//! Internal diagnostics setup.
//!
//! The crate's own machinery (broker plumbing, sink failures, stall
//! recovery) reports through `tracing`; this module wires the subscriber.
//! Application-level log records flow through the
//! [`LogPipeline`](crate::logging::LogPipeline) instead.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Environment;

/// Initialize the tracing subscriber.
///
/// JSON output in production, pretty output in development. The filter
/// honors `RUST_LOG`, falling back to `level`.
///
/// # Errors
///
/// Returns an error if a subscriber is already installed or the filter
/// directive does not parse.
pub fn init_tracing(level: &str, environment: Environment) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    if environment.is_development() {
        let fmt_layer = fmt::layer().pretty().with_target(true);
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()?;
    } else {
        let fmt_layer = fmt::layer().json().with_target(true);
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}
