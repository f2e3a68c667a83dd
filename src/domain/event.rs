use super::error::EventError;
use super::media::{Upload, UploadDefaults, UploadOptions, UploadSource};
use super::naming::FileNameCounters;
use super::sanitize::NumericSanitizer;
use super::wire::{MetricHeader, WireRecord};
use crate::upload::{FileEntry, UploadError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Process-wide reporting state shared by every event built for one reporter:
/// the NaN/Inf policy, filename rotation counters and upload defaults.
#[derive(Debug, Default)]
pub struct ReportingState {
    pub sanitizer: NumericSanitizer,
    counters: Arc<FileNameCounters>,
    defaults: RwLock<UploadDefaults>,
}

impl ReportingState {
    pub fn new(sanitizer: NumericSanitizer, defaults: UploadDefaults) -> Self {
        Self {
            sanitizer,
            counters: Arc::new(FileNameCounters::new()),
            defaults: RwLock::new(defaults),
        }
    }

    pub fn upload_defaults(&self) -> UploadDefaults {
        *self.defaults.read()
    }

    /// Changes the rotation size used by uploads that do not override it.
    pub fn set_default_file_history(&self, size: i64) {
        self.defaults.write().file_history_size = size;
    }

    pub fn counters(&self) -> Arc<FileNameCounters> {
        Arc::clone(&self.counters)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl ConsoleLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            ConsoleLevel::Debug => "debug",
            ConsoleLevel::Info => "info",
            ConsoleLevel::Warning => "warning",
            ConsoleLevel::Error => "error",
            ConsoleLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for ConsoleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
struct EventBase {
    metric: String,
    variant: String,
    iteration: Option<i64>,
    timestamp: i64,
    task: Option<String>,
    model_event: Option<bool>,
}

impl EventBase {
    fn new(metric: impl Into<String>, variant: impl Into<String>, iteration: Option<i64>) -> Self {
        Self {
            metric: metric.into(),
            variant: variant.into(),
            iteration,
            timestamp: chrono::Utc::now().timestamp_millis(),
            task: None,
            model_event: None,
        }
    }

    fn header(&self) -> MetricHeader {
        MetricHeader {
            task: self.task.clone(),
            timestamp: self.timestamp,
            metric: self.metric.clone(),
            variant: self.variant.clone(),
            iter: self.iteration,
            model_event: self.model_event,
        }
    }
}

#[derive(Debug)]
pub enum EventKind {
    Scalar {
        value: f64,
    },
    Vector {
        values: Vec<f64>,
    },
    Plot {
        plot: String,
    },
    Console {
        message: String,
        level: ConsoleLevel,
        worker: String,
    },
    /// Image already hosted somewhere; nothing to upload.
    ImageNoUpload {
        url: String,
        key: String,
    },
    Image(Upload),
    Media(Upload),
    /// Triggers an upload without producing a backend event.
    UploadOnly(Upload),
}

/// Late patch applied to a queued event.
#[derive(Debug, Clone, Default)]
pub struct EventUpdate {
    pub task: Option<String>,
    pub iter_offset: Option<i64>,
    pub url: Option<String>,
    pub key: Option<String>,
}

/// A single reported item waiting to be written.
#[derive(Debug)]
pub struct Event {
    base: EventBase,
    kind: EventKind,
    upload_exception: Option<String>,
    context_applied: bool,
}

impl Event {
    fn build(base: EventBase, kind: EventKind) -> Result<Self, EventError> {
        let event = Self {
            base,
            kind,
            upload_exception: None,
            context_applied: false,
        };
        event.validate()?;
        Ok(event)
    }

    pub fn scalar(
        state: &ReportingState,
        metric: impl Into<String>,
        variant: impl Into<String>,
        value: f64,
        iteration: i64,
    ) -> Result<Self, EventError> {
        let value = state.sanitizer.sanitize(value);
        Self::build(
            EventBase::new(metric, variant, Some(iteration)),
            EventKind::Scalar { value },
        )
    }

    pub fn vector(
        state: &ReportingState,
        metric: impl Into<String>,
        variant: impl Into<String>,
        values: &[f64],
        iteration: i64,
    ) -> Result<Self, EventError> {
        let values = state.sanitizer.sanitize_all(values);
        Self::build(
            EventBase::new(metric, variant, Some(iteration)),
            EventKind::Vector { values },
        )
    }

    pub fn plot(
        metric: impl Into<String>,
        variant: impl Into<String>,
        plot: impl Into<String>,
        iteration: Option<i64>,
    ) -> Result<Self, EventError> {
        Self::build(
            EventBase::new(metric, variant, iteration),
            EventKind::Plot { plot: plot.into() },
        )
    }

    /// Console lines carry no metric or variant and always iteration 0.
    pub fn console(
        message: impl Into<String>,
        level: ConsoleLevel,
        worker: impl Into<String>,
    ) -> Result<Self, EventError> {
        Self::build(
            EventBase::new(String::new(), String::new(), Some(0)),
            EventKind::Console {
                message: message.into(),
                level,
                worker: worker.into(),
            },
        )
    }

    /// Image hosted at `src`; the key is everything after the authority.
    pub fn image_url(
        metric: impl Into<String>,
        variant: impl Into<String>,
        src: impl Into<String>,
        iteration: i64,
    ) -> Result<Self, EventError> {
        let url = src.into();
        if url.is_empty() {
            return Err(EventError::EmptySource);
        }
        let key = url_key(&url).to_string();
        Self::build(
            EventBase::new(metric, variant, Some(iteration)),
            EventKind::ImageNoUpload { url, key },
        )
    }

    pub fn image(
        state: &ReportingState,
        metric: impl Into<String>,
        variant: impl Into<String>,
        iteration: i64,
        source: UploadSource,
        options: UploadOptions,
    ) -> Result<Self, EventError> {
        let upload = Upload::new(source, options, state.upload_defaults(), state.counters())?;
        Self::build(
            EventBase::new(metric, variant, Some(iteration)),
            EventKind::Image(upload),
        )
    }

    pub fn media(
        state: &ReportingState,
        metric: impl Into<String>,
        variant: impl Into<String>,
        iteration: i64,
        source: UploadSource,
        options: UploadOptions,
    ) -> Result<Self, EventError> {
        let upload = Upload::new(source, options, state.upload_defaults(), state.counters())?;
        Self::build(
            EventBase::new(metric, variant, Some(iteration)),
            EventKind::Media(upload),
        )
    }

    pub fn upload_only(
        state: &ReportingState,
        metric: impl Into<String>,
        variant: impl Into<String>,
        iteration: i64,
        source: UploadSource,
        options: UploadOptions,
    ) -> Result<Self, EventError> {
        let upload = Upload::new(source, options, state.upload_defaults(), state.counters())?;
        Self::build(
            EventBase::new(metric, variant, Some(iteration)),
            EventKind::UploadOnly(upload),
        )
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.base.timestamp = timestamp_ms;
        self
    }

    pub fn with_model_event(mut self, model_event: bool) -> Self {
        self.base.model_event = Some(model_event);
        self
    }

    /// Dry-run serialization so invalid values fail at report time.
    fn validate(&self) -> Result<(), EventError> {
        if let Some(record) = self.api_event() {
            serde_json::to_string(&record)?;
        }
        Ok(())
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn metric(&self) -> &str {
        &self.base.metric
    }

    pub fn variant(&self) -> &str {
        &self.base.variant
    }

    pub fn iteration(&self) -> Option<i64> {
        self.base.iteration
    }

    pub fn timestamp(&self) -> i64 {
        self.base.timestamp
    }

    pub fn task(&self) -> Option<&str> {
        self.base.task.as_deref()
    }

    pub fn upload_exception(&self) -> Option<&str> {
        self.upload_exception.as_deref()
    }

    pub fn upload(&self) -> Option<&Upload> {
        match &self.kind {
            EventKind::Image(upload) | EventKind::Media(upload) | EventKind::UploadOnly(upload) => {
                Some(upload)
            }
            _ => None,
        }
    }

    fn upload_mut(&mut self) -> Option<&mut Upload> {
        match &mut self.kind {
            EventKind::Image(upload) | EventKind::Media(upload) | EventKind::UploadOnly(upload) => {
                Some(upload)
            }
            _ => None,
        }
    }

    pub fn has_context(&self) -> bool {
        self.context_applied
    }

    /// Wire representation, or `None` for upload-only events.
    ///
    /// Pure: repeated calls give the same record until `update` is applied.
    pub fn api_event(&self) -> Option<WireRecord> {
        let record = match &self.kind {
            EventKind::Scalar { value } => WireRecord::Scalar {
                header: self.base.header(),
                value: *value,
            },
            EventKind::Vector { values } => WireRecord::Vector {
                header: self.base.header(),
                values: values.clone(),
            },
            EventKind::Plot { plot } => WireRecord::Plot {
                header: self.base.header(),
                plot_str: plot.clone(),
            },
            EventKind::Console {
                message,
                level,
                worker,
            } => WireRecord::Log {
                task: self.base.task.clone(),
                timestamp: self.base.timestamp,
                level: level.as_str().to_string(),
                worker: worker.clone(),
                msg: message.clone(),
            },
            EventKind::ImageNoUpload { url, key } => WireRecord::Image {
                header: self.base.header(),
                url: Some(url.clone()),
                key: Some(key.clone()),
            },
            EventKind::Image(upload) | EventKind::Media(upload) => WireRecord::Image {
                header: self.base.header(),
                url: upload.url.clone(),
                key: upload.key.clone(),
            },
            EventKind::UploadOnly(_) => return None,
        };
        Some(record)
    }

    /// Applies job context and upload results.
    ///
    /// Task and iteration offset are applied at most once per event, so a
    /// retried batch is not shifted twice.
    pub fn update(&mut self, update: EventUpdate) {
        if !self.context_applied && (update.task.is_some() || update.iter_offset.is_some()) {
            if let Some(task) = update.task {
                self.base.task = Some(task);
            }
            if let (Some(offset), Some(iteration)) = (update.iter_offset, self.base.iteration.as_mut())
            {
                if !matches!(self.kind, EventKind::Console { .. }) {
                    *iteration += offset;
                }
            }
            self.context_applied = true;
        }

        if update.url.is_none() && update.key.is_none() {
            return;
        }
        match &mut self.kind {
            EventKind::ImageNoUpload { url, key } => {
                if let Some(new_url) = update.url {
                    *url = new_url;
                }
                if let Some(new_key) = update.key {
                    *key = new_key;
                }
            }
            EventKind::Image(upload) | EventKind::Media(upload) | EventKind::UploadOnly(upload) => {
                if update.url.is_some() {
                    upload.url = update.url;
                }
                if update.key.is_some() {
                    upload.key = update.key;
                }
            }
            _ => {}
        }
    }

    /// Upload target `(key, url)` for upload events.
    pub fn upload_target(
        &mut self,
        storage_uri: Option<&str>,
        key_prefix: Option<&str>,
    ) -> Result<Option<(String, String)>, UploadError> {
        let (metric, variant) = (self.base.metric.clone(), self.base.variant.clone());
        match self.upload_mut() {
            Some(upload) => upload
                .target(&metric, &variant, storage_uri, key_prefix)
                .map(Some),
            None => Ok(None),
        }
    }

    /// Builds the upload job for this event, once.
    pub fn file_entry(
        &mut self,
        storage_uri: Option<&str>,
        key_prefix: Option<&str>,
    ) -> Result<Option<FileEntry>, UploadError> {
        let (metric, variant) = (self.base.metric.clone(), self.base.variant.clone());
        match self.upload_mut() {
            Some(upload) => upload.file_entry(&metric, &variant, storage_uri, key_prefix),
            None => Ok(None),
        }
    }

    pub fn record_upload_failure(&mut self, error: impl fmt::Display) {
        self.upload_exception = Some(error.to_string());
        if let Some(upload) = self.upload_mut() {
            upload.mark_failed();
        }
    }

    /// Folds a delivered upload result back onto the event.
    ///
    /// Returns `Some(true)` on success, `Some(false)` on failure and `None`
    /// when no result was pending.
    pub fn settle_upload(&mut self) -> Option<bool> {
        let result = self.upload_mut()?.take_result()?;
        match result {
            Ok(receipt) => {
                self.update(EventUpdate {
                    url: Some(receipt.url),
                    key: Some(receipt.key),
                    ..Default::default()
                });
                Some(true)
            }
            Err(error) => {
                self.upload_exception = Some(error);
                Some(false)
            }
        }
    }
}

/// Path, params, query and fragment of `url`, without scheme and authority.
fn url_key(url: &str) -> &str {
    match url.split_once("://") {
        Some((_, rest)) => rest.find(['/', '?', '#']).map_or("", |i| &rest[i..]),
        None => url,
    }
}
