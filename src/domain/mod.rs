pub mod error;
pub mod event;
pub mod media;
pub mod naming;
pub mod sanitize;
pub mod wire;

pub use error::EventError;
pub use event::{ConsoleLevel, Event, EventKind, EventUpdate, ReportingState};
pub use media::{ImageArray, Upload, UploadDefaults, UploadOptions, UploadSource};
pub use naming::{FileNameCounters, build_target, escape_storage_name};
pub use sanitize::{NonFinite, NumericSanitizer};
pub use wire::{MetricHeader, WireRecord};
