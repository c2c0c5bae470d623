//! Logging setup
//!
//! Thread names are part of every line so output of the `usb-dispatcher`
//! thread can be told apart from the threads issuing transfers.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `default_level`.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    tracing_subscriber::registry()
        .with(build_filter(default_level)?)
        .with(fmt::layer().with_target(false).with_thread_names(true))
        .try_init()
        .map_err(|e| crate::Error::Config(format!("Logging already initialized: {}", e)))
}

fn build_filter(default_level: &str) -> crate::Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter '{}': {}", default_level, e)))
}
