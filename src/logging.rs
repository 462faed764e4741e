use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{AppError, Result};

/// Picks the filter directive: `RUST_LOG` wins over the config file, and
/// `--verbose` raises the crate to debug.
pub fn filter_directive(config: &LoggingConfig, verbose: bool) -> String {
    match std::env::var("RUST_LOG") {
        Ok(env) if !env.trim().is_empty() => env,
        _ if verbose => format!("{},voice_room_client=debug", config.filter),
        _ => config.filter.clone(),
    }
}

pub fn init(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let filter = EnvFilter::try_new(filter_directive(config, verbose))
        .map_err(|e| AppError::config("logging.filter", e.to_string()))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .map_err(|e| AppError::config("logging", e.to_string()))
}
