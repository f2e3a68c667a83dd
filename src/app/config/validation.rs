use super::{ConfigError, ReporterConfig};
use std::path::Path;
use url::Url;

impl ReporterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_period.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "Flush period must be greater than 0".to_string(),
            ));
        }

        if self.flush_threshold == 0 {
            return Err(ConfigError::InvalidConfig(
                "Flush threshold must be greater than 0".to_string(),
            ));
        }

        if !(1..=100).contains(&self.images.quality) {
            return Err(ConfigError::InvalidConfig(format!(
                "Image quality must be between 1 and 100, got {}",
                self.images.quality
            )));
        }

        if self.upload.retries == 0 {
            return Err(ConfigError::InvalidConfig(
                "Upload retries must be greater than 0".to_string(),
            ));
        }

        if self.upload.max_concurrent == 0 {
            return Err(ConfigError::InvalidConfig(
                "Upload concurrency must be greater than 0".to_string(),
            ));
        }

        // Storage destinations are absolute paths or scheme URLs
        if let Some(uri) = &self.storage_uri
            && !Path::new(uri).is_absolute()
        {
            Url::parse(uri).map_err(|e| {
                ConfigError::InvalidUrl(format!("Invalid storage URI '{uri}': {e}"))
            })?;
        }

        if let Some(endpoint) = &self.events_endpoint {
            Url::parse(endpoint).map_err(|e| {
                ConfigError::InvalidUrl(format!("Invalid events endpoint '{endpoint}': {e}"))
            })?;
        }

        Ok(())
    }
}
