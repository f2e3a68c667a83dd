pub mod serde_helpers;
mod validation;

use crate::dispatch::DispatchMode;
use crate::domain::sanitize::{DEFAULT_SENTINEL, DEFAULT_WARNING_PERIOD};
use crate::domain::{NumericSanitizer, UploadDefaults};
use crate::reliability::{RetryConfig, RetryStrategy};
use crate::upload::ImageSettings;
use serde::{Deserialize, Serialize};
use serde_helpers::{load_env_millis, load_env_string_opt, load_env_var, load_env_var_opt};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("File error: {0}")]
    FileError(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Environment error: {0}")]
    EnvError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Replacement value and warning cadence for one kind of non-finite number.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    pub value: f64,
    pub warn_period: u64,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            value: DEFAULT_SENTINEL,
            warn_period: DEFAULT_WARNING_PERIOD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub retries: u32,
    #[serde(rename = "base_delay_ms", with = "serde_helpers")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "serde_helpers")]
    pub max_delay: Duration,
    pub strategy: RetryStrategy,
    pub jitter: bool,
    pub max_concurrent: usize,
    #[serde(rename = "http_timeout_ms", with = "serde_helpers")]
    pub http_timeout: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            strategy: RetryStrategy::ExponentialBackoff,
            jitter: true,
            max_concurrent: 4,
            http_timeout: Duration::from_secs(60),
        }
    }
}

impl UploadConfig {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            strategy: self.strategy,
            jitter: self.jitter,
        }
    }
}

/// Reporter configuration, loadable from TOML with `METRICS_*` environment
/// overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    pub dispatch_mode: DispatchMode,
    /// Worker poll interval.
    #[serde(rename = "flush_period_ms", with = "serde_helpers")]
    pub flush_period: Duration,
    /// Enqueues between automatic flush signals.
    pub flush_threshold: usize,
    pub async_enable: bool,
    pub images: ImageSettings,
    pub file_history_size: i64,
    pub upload: UploadConfig,
    pub nan: SentinelConfig,
    pub inf: SentinelConfig,
    pub plot_max_num_digits: Option<u32>,
    pub storage_uri: Option<String>,
    pub storage_key_prefix: Option<String>,
    pub events_endpoint: Option<String>,
    pub api_token: Option<String>,
    pub log_level: LogLevel,
    pub log_json: bool,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            dispatch_mode: DispatchMode::Thread,
            flush_period: Duration::from_secs(5),
            flush_threshold: 100,
            async_enable: false,
            images: ImageSettings::default(),
            file_history_size: 5,
            upload: UploadConfig::default(),
            nan: SentinelConfig::default(),
            inf: SentinelConfig::default(),
            plot_max_num_digits: None,
            storage_uri: None,
            storage_key_prefix: None,
            events_endpoint: None,
            api_token: None,
            log_level: LogLevel::Info,
            log_json: false,
        }
    }
}

impl ReporterConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Defaults overlaid with the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        load_env_var("METRICS_DISPATCH_MODE", &mut self.dispatch_mode)?;

        load_env_millis("METRICS_FLUSH_PERIOD_MS", &mut self.flush_period)?;

        load_env_var("METRICS_FLUSH_THRESHOLD", &mut self.flush_threshold)?;
        load_env_var("METRICS_ASYNC_ENABLE", &mut self.async_enable)?;
        load_env_var("METRICS_IMAGE_FORMAT", &mut self.images.format)?;
        load_env_var("METRICS_IMAGE_QUALITY", &mut self.images.quality)?;
        load_env_var("METRICS_IMAGE_SUBSAMPLING", &mut self.images.subsampling)?;
        load_env_var("METRICS_FILE_HISTORY_SIZE", &mut self.file_history_size)?;
        load_env_var("METRICS_UPLOAD_RETRIES", &mut self.upload.retries)?;
        load_env_var("METRICS_UPLOAD_MAX_CONCURRENT", &mut self.upload.max_concurrent)?;

        load_env_millis("METRICS_UPLOAD_HTTP_TIMEOUT_MS", &mut self.upload.http_timeout)?;
        load_env_var_opt("METRICS_PLOT_MAX_NUM_DIGITS", &mut self.plot_max_num_digits)?;

        load_env_string_opt("METRICS_STORAGE_URI", &mut self.storage_uri);
        load_env_string_opt("METRICS_STORAGE_KEY_PREFIX", &mut self.storage_key_prefix);
        load_env_string_opt("METRICS_EVENTS_ENDPOINT", &mut self.events_endpoint);
        load_env_string_opt("METRICS_API_TOKEN", &mut self.api_token);
        load_env_var("METRICS_LOG_LEVEL", &mut self.log_level)?;
        load_env_var("METRICS_LOG_JSON", &mut self.log_json)?;
        Ok(())
    }

    pub fn sanitizer(&self) -> NumericSanitizer {
        NumericSanitizer::new(
            (self.nan.value, self.nan.warn_period),
            (self.inf.value, self.inf.warn_period),
        )
    }

    pub fn upload_defaults(&self) -> UploadDefaults {
        UploadDefaults {
            image: self.images,
            file_history_size: self.file_history_size,
            retries: self.upload.retries,
        }
    }
}
