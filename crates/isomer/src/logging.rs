//! Log subscriber setup.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{IsomerError, Result};

/// Builds the filter: `RUST_LOG` if set, the configured level otherwise.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            IsomerError::Config(format!("invalid log level {:?}: {}", config.level, e))
        }),
    }
}

/// Installs the global tracing subscriber.
///
/// Fails if the level is not a valid filter directive or if a global
/// subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.format {
        LogFormat::Compact => registry
            .with(fmt::layer().with_target(true).compact())
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .json(),
            )
            .try_init(),
    };

    installed.map_err(|e| IsomerError::Config(format!("failed to install logger: {}", e)))
}
