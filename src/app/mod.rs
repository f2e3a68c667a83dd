pub mod config;
pub mod logging;

pub use config::{ConfigError, LogLevel, ReporterConfig, SentinelConfig, UploadConfig};
pub use logging::{LoggingError, init_tracing};
