use bytes::Bytes;
use futures::future::BoxFuture;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Unsupported storage scheme: {0}")]
    UnsupportedScheme(String),
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Upload rejected with HTTP {status}: {url}")]
    Rejected { status: u16, url: String },
}

/// Storage collaborator of the upload path: receives the bytes for one
/// destination URL and returns the URL under which they are available.
pub trait StorageBackend: Send + Sync {
    fn upload<'a>(&'a self, data: Bytes, url: &'a str) -> BoxFuture<'a, Result<String, StorageError>>;
}

/// Writes uploads to the local filesystem (`file://` URLs and absolute paths).
#[derive(Debug, Clone, Default)]
pub struct LocalStorage;

impl LocalStorage {
    fn resolve(url: &str) -> Result<PathBuf, StorageError> {
        let path = PathBuf::from(url.strip_prefix("file://").unwrap_or(url));
        if !path.is_absolute() {
            return Err(StorageError::InvalidDestination(url.to_string()));
        }
        Ok(path)
    }
}

impl StorageBackend for LocalStorage {
    fn upload<'a>(&'a self, data: Bytes, url: &'a str) -> BoxFuture<'a, Result<String, StorageError>> {
        Box::pin(async move {
            let path = Self::resolve(url)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, &data).await?;
            debug!(path = %path.display(), bytes = data.len(), "Stored upload locally");
            Ok(url.to_string())
        })
    }
}

/// Uploads with an HTTP PUT to the destination URL.
#[derive(Debug, Clone)]
pub struct HttpStorage {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpStorage {
    pub fn new(timeout: Duration) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .user_agent(format!("metrics-reporter/{}", crate::VERSION))
            .build()?;
        Ok(Self { client, timeout })
    }
}

impl StorageBackend for HttpStorage {
    fn upload<'a>(&'a self, data: Bytes, url: &'a str) -> BoxFuture<'a, Result<String, StorageError>> {
        Box::pin(async move {
            let bytes = data.len();
            let response = self
                .client
                .put(url)
                .timeout(self.timeout)
                .body(data)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                return Err(StorageError::Rejected {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }
            debug!(url, bytes, "Uploaded over HTTP");
            Ok(url.to_string())
        })
    }
}

/// Picks a backend from the destination scheme.
#[derive(Debug, Clone)]
pub struct SchemeRouter {
    local: LocalStorage,
    http: HttpStorage,
}

impl SchemeRouter {
    pub fn new(http_timeout: Duration) -> Result<Self, StorageError> {
        Ok(Self {
            local: LocalStorage,
            http: HttpStorage::new(http_timeout)?,
        })
    }
}

impl StorageBackend for SchemeRouter {
    fn upload<'a>(&'a self, data: Bytes, url: &'a str) -> BoxFuture<'a, Result<String, StorageError>> {
        match url.split_once("://").map(|(scheme, _)| scheme.to_ascii_lowercase()) {
            None => self.local.upload(data, url),
            Some(scheme) if scheme == "file" => self.local.upload(data, url),
            Some(scheme) if scheme == "http" || scheme == "https" => self.http.upload(data, url),
            Some(scheme) => Box::pin(async move { Err(StorageError::UnsupportedScheme(scheme)) }),
        }
    }
}
