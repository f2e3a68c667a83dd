use super::worker::WorkerCore;
use super::{DispatchError, DispatchMode, Dispatcher};
use crate::buffer::QueueMetrics;
use crate::domain::Event;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, warn};

/// Worker on a dedicated OS thread with its own single-threaded runtime.
///
/// It shares nothing with the caller's runtime and can die on its own; the
/// caller only sees it through its queue and liveness flag.
pub struct IsolatedDispatcher {
    core: Arc<WorkerCore>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl IsolatedDispatcher {
    pub(crate) fn spawn(core: Arc<WorkerCore>) -> Result<Self, DispatchError> {
        let worker = Arc::clone(&core);
        let thread = std::thread::Builder::new()
            .name("metrics-dispatch".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(error = %e, "Failed building isolated dispatch runtime");
                        worker.mark_dead();
                        return;
                    }
                };
                runtime.block_on(worker.run());
            })
            .map_err(DispatchError::Spawn)?;

        Ok(Self {
            core,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Kills the worker without a final drain, as if its process died.
    pub async fn terminate(&self) {
        self.core.kill();
        self.core.wait_until_done().await;
        self.join().await;
    }

    async fn join(&self) {
        let thread = self.thread.lock().take();
        let Some(thread) = thread else {
            return;
        };
        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => warn!("Isolated dispatch worker panicked"),
            Err(e) => warn!(error = %e, "Failed joining isolated dispatch worker"),
        }
    }
}

impl Dispatcher for IsolatedDispatcher {
    fn mode(&self) -> DispatchMode {
        DispatchMode::Isolated
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
            self.join().await;
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

    fn terminate(&self) -> BoxFuture<'_, ()> {
        Box::pin(IsolatedDispatcher::terminate(self))
    }
}
