use super::worker::WorkerCore;
use super::{DispatchMode, Dispatcher};
use crate::buffer::QueueMetrics;
use crate::domain::Event;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::warn;

/// Worker driven as a task on the caller's tokio runtime.
pub struct ThreadDispatcher {
    core: Arc<WorkerCore>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadDispatcher {
    pub(crate) fn spawn(core: Arc<WorkerCore>, runtime: &Handle) -> Self {
        let task = runtime.spawn(Arc::clone(&core).run());
        Self {
            core,
            task: Mutex::new(Some(task)),
        }
    }
}

impl Dispatcher for ThreadDispatcher {
    fn mode(&self) -> DispatchMode {
        DispatchMode::Thread
    }

    fn enqueue(&self, event: Event) -> Result<usize, Event> {
        self.core.enqueue(event)
    }

    fn flush(&self) {
        self.core.signal_flush();
    }

    fn wait_for_events(&self, timeout: Option<Duration>) -> BoxFuture<'_, bool> {
        Box::pin(self.core.wait_for_events(timeout))
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.core.stop().await;
            let task = self.task.lock().take();
            if let Some(task) = task
                && let Err(e) = task.await
            {
                warn!(error = %e, "Metrics dispatch task ended abnormally");
            }
        })
    }

    fn shutdown(&self) {
        self.core.request_shutdown();
    }

    fn is_alive(&self) -> bool {
        self.core.is_alive()
    }

    fn drain_pending(&self) -> Vec<Event> {
        self.core.drain_pending()
    }

    fn events_waiting(&self) -> bool {
        self.core.events_waiting()
    }

    fn queue_metrics(&self) -> QueueMetrics {
        self.core.queue_metrics()
    }

    fn flush_orphaned(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.core.flush_orphaned())
    }
}
