//! Tracing subscriber setup.

use crate::config::LogConfig;
use crate::error::{FeedError, Result};
use tracing_subscriber::EnvFilter;

/// Builds the filter: `RUST_LOG` when set and valid, else the configured
/// directive.
pub fn env_filter(config: &LogConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.filter)
            .map_err(|e| FeedError::Config(format!("invalid log filter {:?}: {}", config.filter, e))),
    }
}

/// Installs the global subscriber.
///
/// Fails with [`FeedError::Telemetry`] if a subscriber is already set.
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let filter = env_filter(config)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let res = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    res.map_err(|e| FeedError::Telemetry(e.to_string()))
}
