use thiserror::Error;

use crate::config::CoreConfig;
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

const DEFAULT_DIRECTIVE: &str = "info,signalhub_core=debug";

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    Filter(String),

    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
}

fn build_filter(directive: Option<&str>) -> Result<EnvFilter, TelemetryError> {
    match directive {
        Some(d) => EnvFilter::try_new(d).map_err(|e| TelemetryError::Filter(e.to_string())),
        None => Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))),
    }
}

/// Installs the global subscriber. An explicit directive beats `RUST_LOG`.
pub fn init_tracing(directive: Option<&str>) -> Result<(), TelemetryError> {
    let filter = build_filter(directive)?;

    registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .map_err(|_| TelemetryError::AlreadyInitialized)
}

/// Installs the global subscriber using `CoreConfig::log_filter`
/// (`SIGNALHUB_LOG`), falling back to `RUST_LOG`.
pub fn init_from_config(config: &CoreConfig) -> Result<(), TelemetryError> {
    init_tracing(config.log_filter.as_deref())
}
