//! Logging initialisation.
//!
//! Every Courier process logs through `tracing`; this module installs the
//! subscriber once at startup, either as human-readable lines or as JSON
//! objects for log shippers.

use crate::{CourierError, CourierResult};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directives used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Emit one JSON object per event instead of formatted lines.
    #[serde(default)]
    pub json_logs: bool,

    /// Include the event target (module path) in each line.
    #[serde(default = "default_with_target")]
    pub with_target: bool,
}

fn default_log_filter() -> String {
    "info,courier=debug".to_string()
}

fn default_with_target() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            json_logs: false,
            with_target: default_with_target(),
        }
    }
}

impl LoggingConfig {
    /// Builds the env filter, preferring `RUST_LOG` over the configured directives.
    pub fn env_filter(&self) -> CourierResult<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.log_filter)
            .map_err(|e| CourierError::Telemetry(format!("Invalid log filter '{}': {}", self.log_filter, e)))
    }
}

/// Installs the global tracing subscriber.
///
/// Fails if a subscriber is already installed or the filter does not parse.
pub fn init_logging(config: &LoggingConfig) -> CourierResult<()> {
    let filter = config.env_filter()?;
    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(config.with_target))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(config.with_target))
            .try_init()
    };

    result.map_err(|e| CourierError::Telemetry(format!("Failed to install subscriber: {}", e)))
}
