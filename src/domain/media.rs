use super::error::EventError;
use super::naming::{FileNameCounters, build_target, escape_storage_name, rotated_file_name};
use crate::upload::codec::{self, ImageSettings};
use crate::upload::{FileEntry, FilePayload, UploadError, UploadReceipt, UploadTicket, completion_pair};
use bytes::Bytes;
use ndarray::ArrayD;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

pub const DEFAULT_UPLOAD_RETRIES: u32 = 3;

/// Pixel data reported as an image.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageArray {
    U8(ArrayD<u8>),
    U16(ArrayD<u16>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
}

impl ImageArray {
    pub fn shape(&self) -> &[usize] {
        match self {
            ImageArray::U8(a) => a.shape(),
            ImageArray::U16(a) => a.shape(),
            ImageArray::F32(a) => a.shape(),
            ImageArray::F64(a) => a.shape(),
        }
    }

    /// Rejects arrays that cannot be promoted to a `(height, width, channels)`
    /// image.
    pub fn validate(&self) -> Result<(), EventError> {
        let shape = self.shape();
        if shape.is_empty() || shape.len() > 3 {
            return Err(EventError::InvalidImage(format!(
                "expected 1 to 3 dimensions, got shape {shape:?}"
            )));
        }
        if shape.contains(&0) {
            return Err(EventError::InvalidImage(format!("empty image shape {shape:?}")));
        }
        if shape.len() == 3 && shape[2] > 4 {
            return Err(EventError::InvalidImage(format!(
                "unsupported channel count {}",
                shape[2]
            )));
        }
        Ok(())
    }
}

impl From<ArrayD<u8>> for ImageArray {
    fn from(array: ArrayD<u8>) -> Self {
        ImageArray::U8(array)
    }
}

impl From<ArrayD<u16>> for ImageArray {
    fn from(array: ArrayD<u16>) -> Self {
        ImageArray::U16(array)
    }
}

impl From<ArrayD<f32>> for ImageArray {
    fn from(array: ArrayD<f32>) -> Self {
        ImageArray::F32(array)
    }
}

impl From<ArrayD<f64>> for ImageArray {
    fn from(array: ArrayD<f64>) -> Self {
        ImageArray::F64(array)
    }
}

/// Where the uploaded bytes come from.
#[derive(Debug, Clone)]
pub enum UploadSource {
    Array(ImageArray),
    Stream(Bytes),
    LocalPath(PathBuf),
}

/// Caller supplied upload knobs.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub upload_uri: Option<String>,
    pub file_history_size: Option<i64>,
    pub delete_after_upload: bool,
    pub override_filename: Option<String>,
    pub override_filename_ext: Option<String>,
    pub override_storage_key_prefix: Option<String>,
}

/// Defaults applied to every upload built from one reporting state.
#[derive(Debug, Clone, Copy)]
pub struct UploadDefaults {
    pub image: ImageSettings,
    pub file_history_size: i64,
    pub retries: u32,
}

impl Default for UploadDefaults {
    fn default() -> Self {
        Self {
            image: ImageSettings::default(),
            file_history_size: 5,
            retries: DEFAULT_UPLOAD_RETRIES,
        }
    }
}

#[derive(Debug, Default)]
enum UploadState {
    #[default]
    Pending,
    InFlight(UploadTicket),
    Uploaded,
    Failed,
}

/// Upload half of image, media and upload-only events.
#[derive(Debug)]
pub struct Upload {
    source: UploadSource,
    options: UploadOptions,
    image: ImageSettings,
    file_history_size: i64,
    retries: u32,
    counters: Arc<FileNameCounters>,
    count: Option<u64>,
    filename: Option<String>,
    upload_filename: Option<String>,
    pub(crate) url: Option<String>,
    pub(crate) key: Option<String>,
    state: UploadState,
}

impl Upload {
    pub(crate) fn new(
        source: UploadSource,
        options: UploadOptions,
        defaults: UploadDefaults,
        counters: Arc<FileNameCounters>,
    ) -> Result<Self, EventError> {
        if let UploadSource::Array(array) = &source {
            array.validate()?;
        }
        let file_history_size = options
            .file_history_size
            .filter(|size| *size != 0)
            .unwrap_or(defaults.file_history_size);

        Ok(Self {
            source,
            options,
            image: defaults.image,
            file_history_size,
            retries: defaults.retries,
            counters,
            count: None,
            filename: None,
            upload_filename: None,
            url: None,
            key: None,
            state: UploadState::Pending,
        })
    }

    pub fn source(&self) -> &UploadSource {
        &self.source
    }

    pub fn count(&self) -> Option<u64> {
        self.count
    }

    pub fn upload_filename(&self) -> Option<&str> {
        self.upload_filename.as_deref()
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.state, UploadState::Uploaded | UploadState::Failed)
    }

    fn generate_file_name(&mut self, metric: &str, variant: &str) {
        if self.upload_filename.is_some() {
            return;
        }
        let count = self.counters.next(metric, variant);
        self.count = Some(count);

        let base = match self.options.override_filename.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => rotated_file_name(metric, variant, count, self.file_history_size),
        };
        let filename = escape_storage_name(&base);

        let ext = match &self.options.override_filename_ext {
            Some(ext) => ext.clone(),
            None => match &self.source {
                UploadSource::Array(_) | UploadSource::Stream(_) => {
                    self.image.format.extension().to_string()
                }
                UploadSource::LocalPath(path) => local_extension(path),
            },
        };
        let ext = if ext.is_empty() || ext.starts_with('.') {
            ext
        } else {
            format!(".{ext}")
        };

        let mut upload_filename = filename.clone();
        let current_ext = filename.rsplit('.').next().unwrap_or_default();
        let wanted_ext = ext.rsplit('.').next().unwrap_or_default();
        if !wanted_ext.is_empty() && current_ext != wanted_ext {
            upload_filename.push_str(&ext);
        }

        self.filename = Some(filename);
        self.upload_filename = Some(upload_filename);
    }

    /// Resolves `(key, url)` for this upload.
    pub(crate) fn target(
        &mut self,
        metric: &str,
        variant: &str,
        storage_uri: Option<&str>,
        key_prefix: Option<&str>,
    ) -> Result<(String, String), UploadError> {
        self.generate_file_name(metric, variant);
        let destination = self
            .options
            .upload_uri
            .as_deref()
            .or(storage_uri)
            .ok_or(UploadError::NoDestination)?;
        let prefix = match self.options.override_storage_key_prefix.as_deref() {
            Some(prefix) => Some(prefix),
            None => key_prefix.filter(|p| !p.is_empty()),
        };
        let filename = self.upload_filename.as_deref().unwrap_or_default();
        Ok(build_target(destination, prefix, metric, variant, filename))
    }

    pub(crate) fn file_entry(
        &mut self,
        metric: &str,
        variant: &str,
        storage_uri: Option<&str>,
        key_prefix: Option<&str>,
    ) -> Result<Option<FileEntry>, UploadError> {
        if !matches!(self.state, UploadState::Pending) {
            return Ok(None);
        }

        let (key, url) = self.target(metric, variant, storage_uri, key_prefix)?;
        let mut delete_local_file = None;
        let payload = match &self.source {
            UploadSource::Array(array) => FilePayload::Bytes(codec::encode_array(array, &self.image)?),
            UploadSource::Stream(bytes) => FilePayload::Bytes(bytes.clone()),
            UploadSource::LocalPath(path) => {
                if !path.is_file() {
                    warn!(
                        path = %path.display(),
                        "Skipping upload, could not find object file"
                    );
                    return Err(UploadError::MissingFile(path.clone()));
                }
                if self.options.delete_after_upload {
                    delete_local_file = Some(path.clone());
                }
                FilePayload::LocalFile(path.clone())
            }
        };

        let (completion, ticket) = completion_pair();
        self.state = UploadState::InFlight(ticket);

        Ok(Some(FileEntry {
            name: self.upload_filename.clone().unwrap_or_default(),
            key,
            url,
            payload,
            retries: self.retries,
            delete_local_file,
            completion,
        }))
    }

    /// Takes the upload result, if the coordinator delivered one.
    pub(crate) fn take_result(&mut self) -> Option<Result<UploadReceipt, String>> {
        let UploadState::InFlight(ticket) = &mut self.state else {
            return None;
        };
        let result = ticket.try_take()?;
        self.state = match &result {
            Ok(_) => UploadState::Uploaded,
            Err(_) => UploadState::Failed,
        };
        Some(result)
    }

    pub(crate) fn mark_failed(&mut self) {
        self.state = UploadState::Failed;
    }
}

/// All suffixes of the file name, e.g. `image.raw.gz` gives `.raw.gz`.
fn local_extension(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.split_once('.'))
        .map(|(_, ext)| format!(".{ext}"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3};

    fn upload(source: UploadSource, options: UploadOptions) -> Upload {
        Upload::new(
            source,
            options,
            UploadDefaults::default(),
            Arc::new(FileNameCounters::new()),
        )
        .unwrap()
    }

    #[test]
    fn rejects_bad_shapes() {
        let scalar = ImageArray::U8(ArrayD::zeros(vec![]));
        assert!(scalar.validate().is_err());

        let many_channels = ImageArray::U8(Array3::zeros((2, 2, 5)).into_dyn());
        assert!(many_channels.validate().is_err());

        let gray = ImageArray::F32(Array2::zeros((4, 4)).into_dyn());
        assert!(gray.validate().is_ok());
    }

    #[test]
    fn local_extension_keeps_all_suffixes() {
        assert_eq!(local_extension(Path::new("/tmp/image.raw.gz")), ".raw.gz");
        assert_eq!(local_extension(Path::new("/tmp/noext")), "");
    }

    #[test]
    fn array_uploads_use_image_format_extension() {
        let mut up = upload(
            UploadSource::Array(ImageArray::U8(Array2::zeros((2, 2)).into_dyn())),
            UploadOptions::default(),
        );
        let (key, url) = up.target("loss", "train", Some("file:///tmp/s"), None).unwrap();
        assert_eq!(key, "loss/train/loss_train_00000000.jpeg");
        assert_eq!(url, "file:///tmp/s/loss/train/loss_train_00000000.jpeg");
    }

    #[test]
    fn override_filename_and_extension() {
        let mut up = upload(
            UploadSource::Stream(Bytes::from_static(b"abc")),
            UploadOptions {
                override_filename: Some("clip.mp4".to_string()),
                override_filename_ext: Some("mp4".to_string()),
                ..Default::default()
            },
        );
        let (key, _) = up.target("m", "v", Some("/data"), None).unwrap();
        assert_eq!(key, "m/v/clip.mp4");
    }

    #[test]
    fn override_prefix_wins_over_default() {
        let mut up = upload(
            UploadSource::Stream(Bytes::from_static(b"abc")),
            UploadOptions {
                override_storage_key_prefix: Some("custom".to_string()),
                ..Default::default()
            },
        );
        let (key, _) = up.target("m", "v", Some("/data"), Some("proj/task")).unwrap();
        assert!(key.starts_with("custom/m/v/"));
    }

    #[test]
    fn missing_destination_is_an_error() {
        let mut up = upload(
            UploadSource::Stream(Bytes::from_static(b"abc")),
            UploadOptions::default(),
        );
        assert!(matches!(
            up.target("m", "v", None, None),
            Err(UploadError::NoDestination)
        ));
    }

    #[test]
    fn missing_local_file_fails_without_entry() {
        let mut up = upload(
            UploadSource::LocalPath(PathBuf::from("/definitely/not/here.png")),
            UploadOptions::default(),
        );
        let result = up.file_entry("m", "v", Some("/data"), None);
        assert!(matches!(result, Err(UploadError::MissingFile(_))));
    }

    #[test]
    fn entry_is_only_produced_once() {
        let mut up = upload(
            UploadSource::Stream(Bytes::from_static(b"abc")),
            UploadOptions::default(),
        );
        let entry = up.file_entry("m", "v", Some("/data"), None).unwrap();
        assert!(entry.is_some());
        assert!(up.file_entry("m", "v", Some("/data"), None).unwrap().is_none());
    }
}
