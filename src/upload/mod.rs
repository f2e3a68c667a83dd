pub mod codec;
pub mod storage;

pub use codec::{CodecError, ImageFormatKind, ImageSettings};
pub use storage::{HttpStorage, LocalStorage, SchemeRouter, StorageBackend, StorageError};

use crate::reliability::RetryPolicy;
use bytes::Bytes;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("No upload destination configured")]
    NoDestination,
    #[error("Could not find object file '{}'", .0.display())]
    MissingFile(PathBuf),
    #[error("Could not read '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Image encoding failed: {0}")]
    Codec(#[from] CodecError),
    #[error("Upload of '{name}' failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        name: String,
        attempts: u32,
        last_error: String,
    },
    #[error("Upload was abandoned before completing")]
    Abandoned,
}

impl UploadError {
    /// Caller errors are never retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, UploadError::RetriesExhausted { .. })
    }
}

/// Confirmed destination of a finished upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub url: String,
    pub key: String,
}

#[derive(Debug, Clone)]
pub enum FilePayload {
    Bytes(Bytes),
    LocalFile(PathBuf),
}

/// Sending half of an upload continuation. The coordinator reports the
/// outcome through it without knowing which event is waiting.
#[derive(Debug)]
pub struct UploadCompletion(oneshot::Sender<Result<UploadReceipt, String>>);

impl UploadCompletion {
    pub fn complete(self, result: Result<UploadReceipt, UploadError>) {
        // receiver gone means the event was dropped; nothing to report to
        let _ = self.0.send(result.map_err(|e| e.to_string()));
    }
}

/// Receiving half held by the event that owns the upload.
#[derive(Debug)]
pub struct UploadTicket(oneshot::Receiver<Result<UploadReceipt, String>>);

impl UploadTicket {
    /// `None` while the upload is still running.
    pub fn try_take(&mut self) -> Option<Result<UploadReceipt, String>> {
        match self.0.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(UploadError::Abandoned.to_string())),
        }
    }
}

pub fn completion_pair() -> (UploadCompletion, UploadTicket) {
    let (tx, rx) = oneshot::channel();
    (UploadCompletion(tx), UploadTicket(rx))
}

/// A single upload job.
#[derive(Debug)]
pub struct FileEntry {
    pub name: String,
    pub key: String,
    pub url: String,
    pub payload: FilePayload,
    pub retries: u32,
    pub delete_local_file: Option<PathBuf>,
    pub completion: UploadCompletion,
}

#[derive(Debug, Default)]
pub struct UploadStats {
    attempts: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UploadStatsSnapshot {
    pub attempts: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl UploadStats {
    pub fn snapshot(&self) -> UploadStatsSnapshot {
        UploadStatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Runs upload jobs against a storage backend with a per-entry retry budget.
pub struct UploadCoordinator {
    storage: Arc<dyn StorageBackend>,
    retry: RetryPolicy,
    max_concurrent: usize,
    stats: UploadStats,
}

impl UploadCoordinator {
    pub fn new(storage: Arc<dyn StorageBackend>, retry: RetryPolicy, max_concurrent: usize) -> Self {
        Self {
            storage,
            retry,
            max_concurrent: max_concurrent.max(1),
            stats: UploadStats::default(),
        }
    }

    pub fn stats(&self) -> UploadStatsSnapshot {
        self.stats.snapshot()
    }

    /// Uploads one entry and reports the outcome on its completion.
    ///
    /// Never returns an error: a failed upload is delivered to the owning
    /// event and logged. Returns whether the upload succeeded.
    pub async fn upload(&self, entry: FileEntry) -> bool {
        let FileEntry {
            name,
            key,
            url,
            payload,
            retries,
            delete_local_file,
            completion,
        } = entry;

        let data = match payload {
            FilePayload::Bytes(data) => data,
            FilePayload::LocalFile(path) => match tokio::fs::read(&path).await {
                Ok(data) => Bytes::from(data),
                Err(e) => {
                    let err = if e.kind() == std::io::ErrorKind::NotFound {
                        UploadError::MissingFile(path)
                    } else {
                        UploadError::Read { path, source: e }
                    };
                    warn!(file = %name, error = %err, "Skipping upload");
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    completion.complete(Err(err));
                    return false;
                }
            },
        };

        let attempts = retries.max(1);
        let mut last_error = String::new();
        for attempt in 0..attempts {
            self.stats.attempts.fetch_add(1, Ordering::Relaxed);
            match self.storage.upload(data.clone(), &url).await {
                Ok(confirmed_url) => {
                    debug!(file = %name, url = %confirmed_url, attempt = attempt + 1, "Upload complete");
                    if let Some(path) = delete_local_file
                        && let Err(e) = tokio::fs::remove_file(&path).await
                    {
                        warn!(path = %path.display(), error = %e, "Failed deleting local file after upload");
                    }
                    self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                    completion.complete(Ok(UploadReceipt {
                        url: confirmed_url,
                        key,
                    }));
                    return true;
                }
                Err(e) => {
                    warn!(
                        file = %name,
                        attempt = attempt + 1,
                        attempts,
                        error = %e,
                        "Upload attempt failed"
                    );
                    last_error = e.to_string();
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.retry.calculate_delay(attempt)).await;
                    }
                }
            }
        }

        let err = UploadError::RetriesExhausted {
            name,
            attempts,
            last_error,
        };
        error!(url = %url, error = %err, "Giving up on upload");
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        completion.complete(Err(err));
        false
    }

    /// Uploads all entries with bounded concurrency; returns
    /// `(succeeded, failed)`.
    pub async fn upload_all(&self, entries: Vec<FileEntry>) -> (usize, usize) {
        let total = entries.len();
        let succeeded = futures::stream::iter(entries)
            .map(|entry| self.upload(entry))
            .buffer_unordered(self.max_concurrent)
            .filter(|ok| futures::future::ready(*ok))
            .count()
            .await;
        (succeeded, total - succeeded)
    }
}
