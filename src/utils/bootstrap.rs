//! Bootstrap utilities for scanbus binaries.
//!
//! Shared initialization code for component processes and tools.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the SCANBUS_LOG environment variable.
///
/// Defaults to "info" level if SCANBUS_LOG is not set. Calling this more than
/// once keeps the first subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
