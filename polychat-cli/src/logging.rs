//! Tracing subscriber setup.

use anyhow::{Context, Result};
use shared::config::{LogFormat, LoggingConfig};
use std::io;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global subscriber. `RUST_LOG` wins over the configured level;
/// output goes to stderr so answers on stdout stay clean.
///
/// # Errors
/// Returns an error for an unparsable level or when a subscriber is already set.
pub fn initialize_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("invalid log level '{}'", config.level))?;

    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Text => registry.with(fmt::layer().with_writer(io::stderr)).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(io::stderr))
            .try_init(),
    }
    .context("failed to install tracing subscriber")
}
