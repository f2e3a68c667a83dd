use super::config::{LogLevel, ReporterConfig};
use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },
    #[error("Global subscriber already installed: {0}")]
    AlreadyInitialized(String),
}

// HTTP stack is chatty at debug level
const QUIET_TARGETS: &[&str] = &["hyper", "reqwest", "h2", "rustls"];

/// Filter directives for `level`, keeping HTTP internals at warn.
pub fn default_filter(level: LogLevel) -> String {
    std::iter::once(level.as_str().to_string())
        .chain(QUIET_TARGETS.iter().map(|target| format!("{target}=warn")))
        .collect::<Vec<_>>()
        .join(",")
}

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `level` when set. Returns an error instead
/// of panicking when a subscriber is already installed, so embedding
/// applications keep their own.
pub fn init_tracing(level: LogLevel, json: bool) -> Result<(), LoggingError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let directives = default_filter(level);
            EnvFilter::try_new(&directives).map_err(|e| LoggingError::InvalidFilter {
                filter: directives.clone(),
                reason: e.to_string(),
            })?
        }
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true),
            )
            .try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };

    result.map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}

impl ReporterConfig {
    /// Installs the global subscriber from `log_level` and `log_json`.
    pub fn init_tracing(&self) -> Result<(), LoggingError> {
        init_tracing(self.log_level, self.log_json)
    }
}
