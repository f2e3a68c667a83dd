pub mod plots;

pub use crate::sender::JobContext;
pub use plots::{BarMode, ChartLayout, LineSeries, PlotMode, Table};

use crate::app::{ConfigError, ReporterConfig};
use crate::buffer::QueueMetrics;
use crate::dispatch::{
    BackgroundDispatcher, DispatchError, DispatchMode, DispatchOptions, DispatchStatsSnapshot,
};
use crate::domain::{
    ConsoleLevel, Event, EventError, EventKind, ImageArray, ReportingState, UploadOptions,
    UploadSource,
};
use crate::reliability::RetryPolicy;
use crate::sender::{
    ContextSlot, EventSink, EventWriter, HttpEventSink, MetricsWriter, SinkConfig, SinkError,
};
use crate::upload::{SchemeRouter, StorageBackend, StorageError, UploadCoordinator, UploadError};
use bytes::Bytes;
use ndarray::ArrayView2;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Invalid event: {0}")]
    Event(#[from] EventError),
    #[error("Upload configuration is required (set a storage URI or pass upload_uri)")]
    UploadDestinationRequired,
    #[error("Expected exactly one of [{0}]")]
    ExclusiveArguments(&'static str),
    #[error("Plot should be a JSON object")]
    InvalidPlot,
    #[error("Upload target error: {0}")]
    Upload(#[from] UploadError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("No events endpoint configured")]
    MissingEndpoint,
    #[error("Invalid events endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Plot payload: an already serialized figure or a JSON value.
#[derive(Debug, Clone)]
pub enum PlotPayload {
    Json(String),
    Value(Value),
}

impl From<String> for PlotPayload {
    fn from(json: String) -> Self {
        PlotPayload::Json(json)
    }
}

impl From<&str> for PlotPayload {
    fn from(json: &str) -> Self {
        PlotPayload::Json(json.to_string())
    }
}

impl From<Value> for PlotPayload {
    fn from(value: Value) -> Self {
        PlotPayload::Value(value)
    }
}

/// Arguments of the image upload calls. Exactly one of `path` and `image`
/// must be set.
#[derive(Debug, Clone, Default)]
pub struct ImageUpload {
    pub path: Option<PathBuf>,
    pub image: Option<ImageArray>,
    pub upload_uri: Option<String>,
    /// Rotation size for this metric/variant; negative keeps every file.
    pub max_image_history: Option<i64>,
    pub delete_after_upload: bool,
}

/// Arguments of the media upload call. Exactly one of `path` and `stream`
/// must be set.
#[derive(Debug, Clone, Default)]
pub struct MediaUpload {
    pub path: Option<PathBuf>,
    pub stream: Option<Bytes>,
    pub upload_uri: Option<String>,
    /// Extension for stream uploads, e.g. `".mp4"`.
    pub file_extension: Option<String>,
    pub max_history: Option<i64>,
    pub delete_after_upload: bool,
}

#[derive(Debug, Clone, Default)]
pub struct HistogramOptions {
    pub labels: Option<Vec<String>>,
    pub xlabels: Option<Vec<String>>,
    pub mode: BarMode,
}

#[derive(Debug, Clone, Default)]
pub struct MatrixOptions {
    pub xlabels: Option<Vec<String>>,
    pub ylabels: Option<Vec<String>>,
    /// Heat maps only: put `(0, 0)` at the top left.
    pub yaxis_reversed: bool,
    /// Surfaces only: camera eye position, `(1, 1, 1)` when unset.
    pub camera: Option<[f64; 3]>,
}

const DEFAULT_PLOT_WIDTH: u32 = 640;
const DEFAULT_PLOT_HEIGHT: u32 = 480;

/// Assembles a [`Reporter`] from configuration, with optional replacements
/// for the writer, sink and storage collaborators.
pub struct ReporterBuilder {
    config: ReporterConfig,
    writer: Option<Arc<dyn MetricsWriter>>,
    sink: Option<Arc<dyn EventSink>>,
    storage: Option<Arc<dyn StorageBackend>>,
    worker_id: Option<String>,
}

impl ReporterBuilder {
    /// Replaces the whole write path. Job context patching is then up to
    /// the writer.
    pub fn writer(mut self, writer: Arc<dyn MetricsWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Starts the background dispatcher. Must run inside a tokio runtime.
    pub fn start(self) -> Result<Reporter, ReportError> {
        let config = self.config;
        config.validate()?;

        let context = ContextSlot::default();
        let writer: Arc<dyn MetricsWriter> = match self.writer {
            Some(writer) => writer,
            None => {
                let sink: Arc<dyn EventSink> = match self.sink {
                    Some(sink) => sink,
                    None => {
                        let endpoint = config
                            .events_endpoint
                            .as_deref()
                            .ok_or(ReportError::MissingEndpoint)?;
                        let mut sink_config = SinkConfig::new(Url::parse(endpoint)?);
                        sink_config.api_token = config.api_token.clone();
                        Arc::new(HttpEventSink::new(sink_config)?)
                    }
                };
                let storage: Arc<dyn StorageBackend> = match self.storage {
                    Some(storage) => storage,
                    None => Arc::new(SchemeRouter::new(config.upload.http_timeout)?),
                };
                let uploads = UploadCoordinator::new(
                    storage,
                    RetryPolicy::new(config.upload.retry_config()),
                    config.upload.max_concurrent,
                );
                Arc::new(EventWriter::new(
                    uploads,
                    sink,
                    config.storage_key_prefix.clone(),
                    Arc::clone(&context),
                ))
            }
        };

        let dispatcher = BackgroundDispatcher::start(writer, DispatchOptions::from(&config))?;
        let worker_id = self.worker_id.unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.to_str().map(|s| s.to_string()))
                .unwrap_or_else(|| "unknown".to_string())
        });

        Ok(Reporter {
            dispatcher: Mutex::new(Some(Arc::new(dispatcher))),
            state: Arc::new(ReportingState::new(
                config.sanitizer(),
                config.upload_defaults(),
            )),
            context,
            storage_uri: RwLock::new(config.storage_uri.clone()),
            key_prefix: config.storage_key_prefix.clone(),
            max_iteration: AtomicI64::new(0),
            max_float_digits: config.plot_max_num_digits,
            worker_id,
        })
    }
}

/// Public reporting surface: validates arguments, builds events and hands
/// them to the background dispatcher.
///
/// `report_*` calls never block on the backend and only fail on invalid
/// arguments. After [`Reporter::stop`] they are accepted and dropped.
pub struct Reporter {
    dispatcher: Mutex<Option<Arc<BackgroundDispatcher>>>,
    state: Arc<ReportingState>,
    context: ContextSlot,
    storage_uri: RwLock<Option<String>>,
    key_prefix: Option<String>,
    max_iteration: AtomicI64,
    max_float_digits: Option<u32>,
    worker_id: String,
}

impl Reporter {
    pub fn builder(config: ReporterConfig) -> ReporterBuilder {
        ReporterBuilder {
            config,
            writer: None,
            sink: None,
            storage: None,
            worker_id: None,
        }
    }

    pub fn start(config: ReporterConfig) -> Result<Self, ReportError> {
        Self::builder(config).start()
    }

    fn dispatcher(&self) -> Option<Arc<BackgroundDispatcher>> {
        self.dispatcher.lock().clone()
    }

    fn report(&self, event: Event) {
        let Some(dispatcher) = self.dispatcher() else {
            debug!(metric = event.metric(), "Reporter stopped, event dropped");
            return;
        };
        if let Some(iteration) = event.iteration()
            && !matches!(event.kind(), EventKind::Console { .. })
        {
            let offset = self
                .context
                .read()
                .as_ref()
                .map_or(0, |ctx| ctx.iteration_offset);
            self.max_iteration
                .fetch_max(iteration + offset, Ordering::SeqCst);
        }
        if let Err(e) = dispatcher.add_event(event) {
            warn!(error = %e, "Event not queued");
        }
    }

    pub fn state(&self) -> &ReportingState {
        &self.state
    }

    pub fn report_scalar(
        &self,
        metric: &str,
        variant: &str,
        value: f64,
        iteration: i64,
    ) -> Result<(), ReportError> {
        self.report(Event::scalar(&self.state, metric, variant, value, iteration)?);
        Ok(())
    }

    pub fn report_vector(
        &self,
        metric: &str,
        variant: &str,
        values: &[f64],
        iteration: i64,
    ) -> Result<(), ReportError> {
        self.report(Event::vector(&self.state, metric, variant, values, iteration)?);
        Ok(())
    }

    /// Reports a plotly figure. Numbers in the figure's traces are rounded
    /// to `round_digits`, or to the configured precision when unset.
    pub fn report_plot(
        &self,
        metric: &str,
        variant: &str,
        plot: impl Into<PlotPayload>,
        iteration: i64,
        round_digits: Option<u32>,
        nan_as_null: bool,
    ) -> Result<(), ReportError> {
        let round_digits = round_digits.or(self.max_float_digits);
        self.report_figure(metric, variant, plot.into(), iteration, round_digits, nan_as_null)
    }

    fn report_figure(
        &self,
        metric: &str,
        variant: &str,
        plot: PlotPayload,
        iteration: i64,
        round_digits: Option<u32>,
        nan_as_null: bool,
    ) -> Result<(), ReportError> {
        let plot = match plot {
            PlotPayload::Json(json) => json,
            PlotPayload::Value(mut value) => {
                if !value.is_object() {
                    return Err(ReportError::InvalidPlot);
                }
                plots::normalize_traces(&mut value, round_digits, nan_as_null);
                value.to_string()
            }
        };
        self.report(Event::plot(metric, variant, plot, Some(iteration))?);
        Ok(())
    }

    /// Reports an image already available at `src`.
    pub fn report_image(
        &self,
        metric: &str,
        variant: &str,
        src: &str,
        iteration: i64,
    ) -> Result<(), ReportError> {
        self.report(Event::image_url(metric, variant, src, iteration)?);
        Ok(())
    }

    /// Reports a media file already available at `src`.
    pub fn report_media(
        &self,
        metric: &str,
        variant: &str,
        src: &str,
        iteration: i64,
    ) -> Result<(), ReportError> {
        self.report_image(metric, variant, src, iteration)
    }

    fn require_destination(&self, upload_uri: Option<&str>) -> Result<(), ReportError> {
        if upload_uri.is_none() && self.storage_uri.read().is_none() {
            return Err(ReportError::UploadDestinationRequired);
        }
        Ok(())
    }

    fn image_source(
        path: Option<PathBuf>,
        image: Option<ImageArray>,
        names: &'static str,
    ) -> Result<UploadSource, ReportError> {
        match (path, image) {
            (Some(path), None) => Ok(UploadSource::LocalPath(path)),
            (None, Some(image)) => Ok(UploadSource::Array(image)),
            _ => Err(ReportError::ExclusiveArguments(names)),
        }
    }

    pub fn report_image_and_upload(
        &self,
        metric: &str,
        variant: &str,
        iteration: i64,
        upload: ImageUpload,
    ) -> Result<(), ReportError> {
        self.require_destination(upload.upload_uri.as_deref())?;
        let source = Self::image_source(upload.path, upload.image, "path, image")?;
        let options = UploadOptions {
            upload_uri: upload.upload_uri,
            file_history_size: upload.max_image_history,
            delete_after_upload: upload.delete_after_upload,
            ..Default::default()
        };
        self.report(Event::image(&self.state, metric, variant, iteration, source, options)?);
        Ok(())
    }

    pub fn report_media_and_upload(
        &self,
        metric: &str,
        variant: &str,
        iteration: i64,
        upload: MediaUpload,
    ) -> Result<(), ReportError> {
        self.require_destination(upload.upload_uri.as_deref())?;
        let source = match (upload.path, upload.stream) {
            (Some(path), None) => UploadSource::LocalPath(path),
            (None, Some(stream)) => UploadSource::Stream(stream),
            _ => return Err(ReportError::ExclusiveArguments("path, stream")),
        };
        let options = UploadOptions {
            upload_uri: upload.upload_uri,
            file_history_size: upload.max_history,
            delete_after_upload: upload.delete_after_upload,
            override_filename_ext: upload.file_extension,
            ..Default::default()
        };
        self.report(Event::media(&self.state, metric, variant, iteration, source, options)?);
        Ok(())
    }

    /// Uploads an image and reports a plot showing it. Browsers can only
    /// render http(s) images, so other destinations fall back to a plain
    /// image report.
    pub fn report_image_plot_and_upload(
        &self,
        metric: &str,
        variant: &str,
        iteration: i64,
        upload: ImageUpload,
    ) -> Result<(), ReportError> {
        self.require_destination(upload.upload_uri.as_deref())?;
        if upload.path.is_some() == upload.image.is_some() {
            return Err(ReportError::ExclusiveArguments("path, matrix"));
        }
        let destination = upload
            .upload_uri
            .clone()
            .or_else(|| self.storage_uri.read().clone());
        if !destination.is_some_and(|uri| uri.starts_with("http")) {
            return self.report_image_and_upload(metric, variant, iteration, upload);
        }

        let (width, height) = match (&upload.image, &upload.path) {
            (Some(image), _) => {
                let shape = image.shape();
                (
                    shape.get(1).copied().unwrap_or(0) as u32,
                    shape.first().copied().unwrap_or(0) as u32,
                )
            }
            (None, Some(path)) => image::image_dimensions(path)
                .unwrap_or((DEFAULT_PLOT_WIDTH, DEFAULT_PLOT_HEIGHT)),
            (None, None) => (DEFAULT_PLOT_WIDTH, DEFAULT_PLOT_HEIGHT),
        };

        let source = Self::image_source(upload.path, upload.image, "path, matrix")?;
        let options = UploadOptions {
            upload_uri: upload.upload_uri,
            file_history_size: upload.max_image_history,
            delete_after_upload: upload.delete_after_upload,
            ..Default::default()
        };
        let mut event = Event::upload_only(&self.state, metric, variant, iteration, source, options)?;
        let storage_uri = self.storage_uri.read().clone();
        let Some((_, url)) = event.upload_target(storage_uri.as_deref(), self.key_prefix.as_deref())?
        else {
            return Err(ReportError::UploadDestinationRequired);
        };

        self.report(event);
        let width = if width == 0 { DEFAULT_PLOT_WIDTH } else { width };
        let height = if height == 0 { DEFAULT_PLOT_HEIGHT } else { height };
        let plot_height =
            (DEFAULT_PLOT_WIDTH as f64 * f64::from(height) / f64::from(width)) as u32;
        let plot = plots::image_plot(
            &url,
            &format!("{metric}/{variant}"),
            DEFAULT_PLOT_WIDTH,
            plot_height,
        );
        self.report_figure(metric, variant, plot.into(), iteration, None, false)
    }

    pub fn report_histogram(
        &self,
        metric: &str,
        variant: &str,
        rows: ArrayView2<'_, f64>,
        iteration: i64,
        options: &HistogramOptions,
        layout: &ChartLayout,
    ) -> Result<(), ReportError> {
        let plot = plots::histogram(
            rows,
            metric,
            variant,
            options.labels.as_deref(),
            options.xlabels.as_deref(),
            options.mode,
            layout,
        );
        self.report_figure(metric, variant, plot.into(), iteration, self.max_float_digits, false)
    }

    /// Table cells are reported verbatim, without rounding.
    pub fn report_table(
        &self,
        metric: &str,
        variant: &str,
        table: &Table,
        iteration: i64,
        layout: &ChartLayout,
    ) -> Result<(), ReportError> {
        let plot = plots::table(table, metric, variant, layout);
        self.report_figure(metric, variant, plot.into(), iteration, None, false)
    }

    /// One plot holding several lines; reported with an empty variant.
    pub fn report_line_plot(
        &self,
        metric: &str,
        series: &[LineSeries<'_>],
        iteration: i64,
        mode: PlotMode,
        reverse_xaxis: bool,
        layout: &ChartLayout,
    ) -> Result<(), ReportError> {
        let plot = plots::line_plot(metric, series, mode, reverse_xaxis, layout);
        self.report_figure(metric, "", plot.into(), iteration, self.max_float_digits, false)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn report_2d_scatter(
        &self,
        metric: &str,
        variant: &str,
        data: ArrayView2<'_, f64>,
        iteration: i64,
        mode: PlotMode,
        labels: Option<&[String]>,
        layout: &ChartLayout,
    ) -> Result<(), ReportError> {
        let plot = plots::scatter_2d(data, metric, variant, mode, labels, layout);
        self.report_figure(metric, variant, plot.into(), iteration, self.max_float_digits, false)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn report_3d_scatter(
        &self,
        metric: &str,
        variant: &str,
        data: &[ArrayView2<'_, f64>],
        iteration: i64,
        mode: PlotMode,
        labels: Option<&[String]>,
        layout: &ChartLayout,
    ) -> Result<(), ReportError> {
        let names = vec![variant.to_string()];
        let plot = plots::scatter_3d(data, metric, &names, mode, labels, layout);
        self.report_figure(metric, variant, plot.into(), iteration, self.max_float_digits, false)
    }

    pub fn report_value_matrix(
        &self,
        metric: &str,
        variant: &str,
        matrix: ArrayView2<'_, f64>,
        iteration: i64,
        options: &MatrixOptions,
        layout: &ChartLayout,
    ) -> Result<(), ReportError> {
        let plot = plots::value_matrix(
            matrix,
            metric,
            variant,
            options.xlabels.as_deref(),
            options.ylabels.as_deref(),
            options.yaxis_reversed,
            layout,
        );
        self.report_figure(metric, variant, plot.into(), iteration, self.max_float_digits, false)
    }

    pub fn report_value_surface(
        &self,
        metric: &str,
        variant: &str,
        matrix: ArrayView2<'_, f64>,
        iteration: i64,
        options: &MatrixOptions,
        layout: &ChartLayout,
    ) -> Result<(), ReportError> {
        let plot = plots::value_surface(
            matrix,
            &format!("{metric}/{variant}"),
            variant,
            options.xlabels.as_deref(),
            options.ylabels.as_deref(),
            options.camera,
            layout,
        );
        self.report_figure(metric, variant, plot.into(), iteration, self.max_float_digits, false)
    }

    /// Console line attributed to the job's worker, or this host.
    pub fn report_console(&self, message: &str, level: ConsoleLevel) -> Result<(), ReportError> {
        let worker = self
            .context
            .read()
            .as_ref()
            .and_then(|ctx| ctx.worker.clone())
            .unwrap_or_else(|| self.worker_id.clone());
        self.report(Event::console(message, level, worker)?);
        Ok(())
    }

    /// Changes the NaN sentinel and warning period for every event built
    /// from now on.
    pub fn set_reporting_nan_value(&self, value: f64, warn_period: u64) {
        self.state.sanitizer.set_nan_value(value, warn_period);
    }

    pub fn set_reporting_inf_value(&self, value: f64, warn_period: u64) {
        self.state.sanitizer.set_inf_value(value, warn_period);
    }

    /// Default rotation size for uploads that do not set their own.
    pub fn set_default_debug_sample_history(&self, size: i64) {
        self.state.set_default_file_history(size);
    }

    /// Binds queued and future events to a job. Events are patched when
    /// written, not before.
    pub fn attach_context(&self, context: JobContext) {
        info!(task_id = %context.task_id, "Job context attached");
        *self.context.write() = Some(context);
    }

    pub fn context(&self) -> Option<JobContext> {
        self.context.read().clone()
    }

    pub fn storage_uri(&self) -> Option<String> {
        self.storage_uri.read().clone()
    }

    pub fn set_storage_uri(&self, storage_uri: Option<String>) {
        *self.storage_uri.write() = storage_uri.clone();
        if let Some(dispatcher) = self.dispatcher() {
            dispatcher.set_storage_uri(storage_uri);
        }
    }

    /// Highest iteration reported so far, including the job's offset.
    pub fn max_iteration(&self) -> i64 {
        self.max_iteration.load(Ordering::SeqCst)
    }

    /// Signals an immediate drain. With `wait`, returns once a drain that
    /// covers every event reported before this call finished, or false on
    /// timeout.
    pub async fn flush(&self, wait: bool, timeout: Option<Duration>) -> bool {
        let Some(dispatcher) = self.dispatcher() else {
            return true;
        };
        if !wait {
            dispatcher.flush();
            return true;
        }
        dispatcher.wait_for_events(timeout).await
    }

    pub async fn wait_for_events(&self, timeout: Option<Duration>) -> bool {
        match self.dispatcher() {
            Some(dispatcher) => dispatcher.wait_for_events(timeout).await,
            None => true,
        }
    }

    /// Drains and stops the dispatcher. The dispatcher is detached first so
    /// concurrent callers see a stopped reporter; later calls do nothing.
    pub async fn stop(&self) {
        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.stop().await;
        }
    }

    pub fn is_alive(&self) -> bool {
        self.dispatcher().is_some_and(|d| d.is_alive())
    }

    pub fn mode(&self) -> Option<DispatchMode> {
        self.dispatcher().map(|d| d.mode())
    }

    pub fn events_waiting(&self) -> bool {
        self.dispatcher().is_some_and(|d| d.events_waiting())
    }

    pub fn dispatch_stats(&self) -> Option<DispatchStatsSnapshot> {
        self.dispatcher().map(|d| d.stats())
    }

    pub fn queue_metrics(&self) -> Option<QueueMetrics> {
        self.dispatcher().map(|d| d.queue_metrics())
    }

    /// Runs `body` and flushes, waiting, only if it succeeded.
    pub async fn scoped<F, T, E>(&self, body: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let output = body.await?;
        self.flush(true, None).await;
        Ok(output)
    }
}
