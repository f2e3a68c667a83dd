use super::serialization::{SerializationError, gzip, serialize_ndjson};
use crate::domain::WireRecord;
use futures::future::BoxFuture;
use reqwest::header::{
    AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

// Batches larger than this are gzip compressed
const COMPRESSION_THRESHOLD: usize = 100;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Serialization failed: {0}")]
    Serialization(#[from] SerializationError),
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Backend rejected batch {batch_id} with HTTP {status}")]
    Rejected { batch_id: String, status: u16 },
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(String),
    #[error("Sink unavailable: {0}")]
    Unavailable(String),
}

/// Final hop of the pipeline: delivers serialized records to the backend.
pub trait EventSink: Send + Sync {
    fn send_events<'a>(
        &'a self,
        batch_id: &'a str,
        records: Vec<WireRecord>,
    ) -> BoxFuture<'a, Result<(), SinkError>>;
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub endpoint: Url,
    pub timeout: Duration,
    pub enable_compression: bool,
    pub user_agent: String,
    pub api_token: Option<String>,
}

impl SinkConfig {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            timeout: Duration::from_secs(30),
            enable_compression: true,
            user_agent: format!("metrics-reporter/{}", crate::VERSION),
            api_token: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct SinkStats {
    requests: AtomicU64,
    failures: AtomicU64,
    bytes_sent: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SinkStatsSnapshot {
    pub requests: u64,
    pub failures: u64,
    pub bytes_sent: u64,
}

impl SinkStats {
    fn record(&self, success: bool, bytes: usize) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> SinkStatsSnapshot {
        SinkStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

/// Posts record batches as NDJSON to the events endpoint.
pub struct HttpEventSink {
    client: reqwest::Client,
    config: SinkConfig,
    stats: SinkStats,
}

impl HttpEventSink {
    pub fn new(config: SinkConfig) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            config,
            stats: SinkStats::default(),
        })
    }

    pub fn stats(&self) -> SinkStatsSnapshot {
        self.stats.snapshot()
    }

    fn build_headers(
        &self,
        batch_id: &str,
        size: usize,
        compressed: bool,
    ) -> Result<HeaderMap, SinkError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-ndjson"));
        if compressed {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }

        let invalid = |what: &str, e: reqwest::header::InvalidHeaderValue| {
            SinkError::InvalidHeaderValue(format!("Invalid {what}: {e}"))
        };
        headers.insert(
            HeaderName::from_static("x-batch-id"),
            HeaderValue::from_str(batch_id).map_err(|e| invalid("batch ID", e))?,
        );
        headers.insert(
            HeaderName::from_static("x-batch-size"),
            HeaderValue::from_str(&size.to_string()).map_err(|e| invalid("batch size", e))?,
        );
        headers.insert(
            HeaderName::from_static("x-reporter-version"),
            HeaderValue::from_static(crate::VERSION),
        );
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.config.user_agent).map_err(|e| invalid("user agent", e))?,
        );
        if let Some(token) = &self.config.api_token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| invalid("token", e))?,
            );
        }
        Ok(headers)
    }

    async fn post(&self, batch_id: &str, records: Vec<WireRecord>) -> Result<(), SinkError> {
        let start = Instant::now();
        let size = records.len();
        let compressed = self.config.enable_compression && size > COMPRESSION_THRESHOLD;

        let mut payload = serialize_ndjson(&records)?;
        if compressed {
            payload = gzip(&payload)?;
        }
        let bytes = payload.len();
        let headers = self.build_headers(batch_id, size, compressed)?;

        debug!(batch_id, records = size, bytes, compressed, "Posting events");
        let response = self
            .client
            .post(self.config.endpoint.clone())
            .headers(headers)
            .body(payload)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.stats.record(false, bytes);
                return Err(e.into());
            }
        };

        let status = response.status();
        self.stats.record(status.is_success(), bytes);
        if !status.is_success() {
            warn!(batch_id, status = status.as_u16(), "Backend rejected events");
            return Err(SinkError::Rejected {
                batch_id: batch_id.to_string(),
                status: status.as_u16(),
            });
        }

        info!(
            batch_id,
            records = size,
            bytes,
            latency_ms = start.elapsed().as_millis() as u64,
            "Sent events"
        );
        Ok(())
    }
}

impl EventSink for HttpEventSink {
    fn send_events<'a>(
        &'a self,
        batch_id: &'a str,
        records: Vec<WireRecord>,
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(self.post(batch_id, records))
    }
}
