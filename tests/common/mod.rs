#![allow(dead_code)]

use bytes::Bytes;
use futures::future::BoxFuture;
use metrics_reporter::buffer::Batch;
use metrics_reporter::domain::{Event, WireRecord};
use metrics_reporter::sender::{EventSink, MetricsWriter, SinkError, WriteSummary, WriterError};
use metrics_reporter::upload::{StorageBackend, StorageError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// Writer that remembers the metric name of every written event, in order.
#[derive(Default)]
pub struct RecordingWriter {
    pub metrics: Mutex<Vec<String>>,
    pub panic_on_write: AtomicBool,
}

impl RecordingWriter {
    pub fn written(&self) -> Vec<String> {
        self.metrics.lock().clone()
    }

    /// Polls until `count` events were written or `limit` elapsed.
    pub async fn wait_for(&self, count: usize, limit: Duration) -> bool {
        let poll = async {
            while self.metrics.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(limit, poll).await.is_ok()
    }
}

impl MetricsWriter for RecordingWriter {
    fn write_batch<'a>(
        &'a self,
        batch: &'a mut Batch,
        _storage_uri: Option<&'a str>,
    ) -> BoxFuture<'a, Result<WriteSummary, WriterError>> {
        Box::pin(async move {
            if self.panic_on_write.swap(false, Ordering::SeqCst) {
                panic!("writer crashed");
            }
            self.metrics
                .lock()
                .extend(batch.events().iter().map(|e| e.metric().to_string()));
            Ok(WriteSummary {
                events: batch.size(),
                ..Default::default()
            })
        })
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub records: Mutex<Vec<WireRecord>>,
}

impl RecordingSink {
    pub fn records(&self) -> Vec<WireRecord> {
        self.records.lock().clone()
    }
}

impl EventSink for RecordingSink {
    fn send_events<'a>(
        &'a self,
        _batch_id: &'a str,
        records: Vec<WireRecord>,
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            self.records.lock().extend(records);
            Ok(())
        })
    }
}

/// Storage that rejects every upload and counts the attempts.
#[derive(Default)]
pub struct FailingStorage {
    pub attempts: AtomicU32,
}

impl StorageBackend for FailingStorage {
    fn upload<'a>(&'a self, _data: Bytes, url: &'a str) -> BoxFuture<'a, Result<String, StorageError>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Rejected {
                status: 503,
                url: url.to_string(),
            })
        })
    }
}

pub fn plot(metric: &str) -> Event {
    Event::plot(metric, "series", "{}", None).unwrap()
}
