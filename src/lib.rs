#![deny(warnings, rust_2024_compatibility)]
// Specific pedantic lints enforced (not blanket allow):
#![deny(
    clippy::explicit_iter_loop,
    clippy::manual_let_else,
    clippy::semicolon_if_nothing_returned,
    clippy::inconsistent_struct_constructor
)]
// Noisy pedantic lints suppressed with justification:
#![allow(
    clippy::cast_lossless,            // Infallible casts are clear enough with `as`
    clippy::cast_possible_truncation, // Pixel quantization truncates on purpose
    clippy::cast_possible_wrap,       // Iteration counters stay far below i64::MAX
    clippy::cast_precision_loss,      // Acceptable for plotted values
    clippy::cast_sign_loss,           // Safe where values are known non-negative
    clippy::missing_errors_doc,       // Internal API
    clippy::missing_panics_doc,       // Internal API
    clippy::module_name_repetitions,  // e.g. UploadError in upload module
    clippy::must_use_candidate,       // Annotated selectively on critical APIs
    clippy::doc_markdown              // Internal API
)]

pub mod app;
pub mod buffer;
pub mod dispatch;
pub mod domain;
pub mod reliability;
pub mod reporter;
pub mod sender;
pub mod upload;

// Re-export main types for easy access
pub use app::{ReporterConfig, init_tracing};
pub use dispatch::{BackgroundDispatcher, DispatchMode};
pub use domain::{Event, EventKind, WireRecord};
pub use reporter::{JobContext, ReportError, Reporter};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
