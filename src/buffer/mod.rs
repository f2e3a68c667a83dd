pub mod batch;
pub mod queue;

pub use batch::{Batch, FlushTrigger};
pub use queue::{EventQueue, QueueMetrics};
