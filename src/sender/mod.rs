pub mod serialization;
pub mod sink;

pub use serialization::SerializationError;
pub use sink::{EventSink, HttpEventSink, SinkConfig, SinkError};

use crate::buffer::Batch;
use crate::domain::{Event, EventUpdate, WireRecord};
use crate::upload::UploadCoordinator;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum WriterError {
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),
}

/// Identity of the job the reports belong to. Attached once known; events
/// queued before that are patched when written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobContext {
    pub task_id: String,
    pub worker: Option<String>,
    pub iteration_offset: i64,
}

/// Shared, late-bound job context.
pub type ContextSlot = Arc<RwLock<Option<JobContext>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteSummary {
    pub events: usize,
    pub records: usize,
    pub uploads_succeeded: usize,
    pub uploads_failed: usize,
}

/// The metrics-writer seam the dispatcher drains into.
///
/// A failed write leaves the batch untouched apart from settled uploads, so
/// it can be written again.
pub trait MetricsWriter: Send + Sync {
    fn write_batch<'a>(
        &'a self,
        batch: &'a mut Batch,
        storage_uri: Option<&'a str>,
    ) -> BoxFuture<'a, Result<WriteSummary, WriterError>>;
}

/// Default writer: patches job context, runs uploads, then sends the wire
/// records of the batch to the sink.
pub struct EventWriter {
    uploads: UploadCoordinator,
    sink: Arc<dyn EventSink>,
    key_prefix: Option<String>,
    context: ContextSlot,
}

impl EventWriter {
    pub fn new(
        uploads: UploadCoordinator,
        sink: Arc<dyn EventSink>,
        key_prefix: Option<String>,
        context: ContextSlot,
    ) -> Self {
        Self {
            uploads,
            sink,
            key_prefix,
            context,
        }
    }

    pub fn uploads(&self) -> &UploadCoordinator {
        &self.uploads
    }

    async fn write(
        &self,
        batch: &mut Batch,
        storage_uri: Option<&str>,
    ) -> Result<WriteSummary, WriterError> {
        batch.record_attempt();
        let context = self.context.read().clone();
        let mut entries = Vec::new();

        for event in batch.events_mut() {
            if let Some(ctx) = &context
                && !event.has_context()
            {
                event.update(EventUpdate {
                    task: Some(ctx.task_id.clone()),
                    iter_offset: Some(ctx.iteration_offset),
                    ..Default::default()
                });
            }

            match event.file_entry(storage_uri, self.key_prefix.as_deref()) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        metric = event.metric(),
                        variant = event.variant(),
                        error = %e,
                        "Upload skipped"
                    );
                    event.record_upload_failure(&e);
                }
            }
        }

        let (uploads_succeeded, uploads_failed) = if entries.is_empty() {
            (0, 0)
        } else {
            self.uploads.upload_all(entries).await
        };
        for event in batch.events_mut() {
            event.settle_upload();
        }

        let records: Vec<WireRecord> = batch.events().iter().filter_map(Event::api_event).collect();
        let summary = WriteSummary {
            events: batch.size(),
            records: records.len(),
            uploads_succeeded,
            uploads_failed,
        };

        if !records.is_empty() {
            self.sink.send_events(batch.id(), records).await?;
        }
        debug!(batch_id = batch.id(), ?summary, "Batch written");
        Ok(summary)
    }
}

impl MetricsWriter for EventWriter {
    fn write_batch<'a>(
        &'a self,
        batch: &'a mut Batch,
        storage_uri: Option<&'a str>,
    ) -> BoxFuture<'a, Result<WriteSummary, WriterError>> {
        Box::pin(self.write(batch, storage_uri))
    }
}
