pub mod background;
pub mod isolated;
pub mod thread;
mod worker;

pub use background::{BackgroundDispatcher, DispatchOptions, DispatcherState};
pub use isolated::IsolatedDispatcher;
pub use thread::ThreadDispatcher;
pub use worker::{DispatchSettings, DispatchStats, DispatchStatsSnapshot};

use crate::buffer::QueueMetrics;
use crate::domain::Event;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("A tokio runtime is required to start the dispatcher")]
    NoRuntime,
    #[error("Failed spawning dispatch worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("Dispatcher is stopped")]
    Stopped,
    #[error("Dispatch queue is closed")]
    QueueClosed,
}

/// Where the dispatch worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Task on the caller's runtime.
    #[default]
    Thread,
    /// Dedicated OS thread with its own runtime.
    Isolated,
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchMode::Thread => f.write_str("thread"),
            DispatchMode::Isolated => f.write_str("isolated"),
        }
    }
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "thread" => Ok(DispatchMode::Thread),
            "isolated" | "subprocess" => Ok(DispatchMode::Isolated),
            other => Err(format!("unknown dispatch mode '{other}'")),
        }
    }
}

/// One running dispatch worker and its transport queue.
pub trait Dispatcher: Send + Sync {
    fn mode(&self) -> DispatchMode;

    /// Hands the event back when the queue no longer accepts events.
    fn enqueue(&self, event: Event) -> Result<usize, Event>;

    /// Wakes the worker for an early drain.
    fn flush(&self);

    fn wait_for_events(&self, timeout: Option<Duration>) -> BoxFuture<'_, bool>;

    fn stop(&self) -> BoxFuture<'_, ()>;

    /// Starts a graceful stop without waiting for the final drain.
    fn shutdown(&self);

    fn is_alive(&self) -> bool;

    /// Closes the queue and returns the events never dequeued.
    fn drain_pending(&self) -> Vec<Event>;

    fn events_waiting(&self) -> bool;

    fn queue_metrics(&self) -> QueueMetrics;

    /// Writes the queue of a dead worker from the calling task.
    fn flush_orphaned(&self) -> BoxFuture<'_, ()>;

    /// Hard kill. Only isolated workers can be killed.
    fn terminate(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}
