use super::DispatchMode;
use crate::buffer::{Batch, EventQueue, FlushTrigger, QueueMetrics};
use crate::domain::Event;
use crate::sender::MetricsWriter;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Settings shared by every worker of one dispatcher, including workers
/// created by a mode hand-off.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub poll_interval: Duration,
    pub async_enable: bool,
    pub storage_uri: Arc<RwLock<Option<String>>>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            async_enable: false,
            storage_uri: Arc::new(RwLock::new(None)),
        }
    }
}

#[derive(Debug, Default)]
pub struct DispatchStats {
    batches_written: AtomicU64,
    events_written: AtomicU64,
    write_failures: AtomicU64,
    async_results: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchStatsSnapshot {
    pub batches_written: u64,
    pub events_written: u64,
    pub write_failures: u64,
    pub async_results: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            batches_written: self.batches_written.load(Ordering::Relaxed),
            events_written: self.events_written.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            async_results: self.async_results.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct DrainState {
    // batch whose synchronous write failed; retried ahead of newer events
    retained: Option<Batch>,
    in_flight: JoinSet<()>,
}

/// Queue, signals and drain loop of one dispatch worker.
///
/// Thread and isolated dispatchers differ only in where `run` is driven.
pub(crate) struct WorkerCore {
    mode: DispatchMode,
    queue: EventQueue,
    flush_signal: Notify,
    shutdown: CancellationToken,
    kill: CancellationToken,
    done: CancellationToken,
    alive: AtomicBool,
    // flush tickets: waiters take `requested + 1`, drains publish `completed`
    requested: AtomicU64,
    completed: watch::Sender<u64>,
    drain: AsyncMutex<DrainState>,
    draining: AtomicBool,
    retained: AtomicBool,
    in_flight: AtomicUsize,
    settings: DispatchSettings,
    writer: Arc<dyn MetricsWriter>,
    stats: Arc<DispatchStats>,
}

/// Marks the worker dead however `run` ends, including a panic.
struct ExitGuard<'a>(&'a WorkerCore);

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        self.0.alive.store(false, Ordering::SeqCst);
        self.0.done.cancel();
    }
}

impl WorkerCore {
    pub(crate) fn new(
        mode: DispatchMode,
        settings: DispatchSettings,
        writer: Arc<dyn MetricsWriter>,
        stats: Arc<DispatchStats>,
    ) -> Arc<Self> {
        let (completed, _) = watch::channel(0);
        Arc::new(Self {
            mode,
            queue: EventQueue::new(),
            flush_signal: Notify::new(),
            shutdown: CancellationToken::new(),
            kill: CancellationToken::new(),
            done: CancellationToken::new(),
            alive: AtomicBool::new(true),
            requested: AtomicU64::new(0),
            completed,
            drain: AsyncMutex::new(DrainState::default()),
            draining: AtomicBool::new(false),
            retained: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            settings,
            writer,
            stats,
        })
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Used when the worker could not even be started.
    pub(crate) fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.done.cancel();
    }

    pub(crate) fn enqueue(&self, event: Event) -> Result<usize, Event> {
        self.queue.push(event)
    }

    pub(crate) fn signal_flush(&self) {
        self.flush_signal.notify_one();
    }

    pub(crate) fn events_waiting(&self) -> bool {
        !self.queue.is_empty()
            || self.draining.load(Ordering::SeqCst)
            || self.retained.load(Ordering::SeqCst)
            || self.in_flight.load(Ordering::SeqCst) > 0
    }

    /// Closes the transport queue and returns whatever was never dequeued.
    pub(crate) fn drain_pending(&self) -> Vec<Event> {
        self.queue.close();
        self.queue.drain_all()
    }

    /// Simulated crash: the worker exits at its next wake-up without a final
    /// drain.
    pub(crate) fn kill(&self) {
        self.kill.cancel();
    }

    pub(crate) async fn wait_until_done(&self) {
        self.done.cancelled().await;
    }

    /// Requests a drain and waits until one that started after this call has
    /// finished. Returns false on timeout or if the worker died first.
    pub(crate) async fn wait_for_events(&self, timeout: Option<Duration>) -> bool {
        let ticket = self.requested.fetch_add(1, Ordering::SeqCst) + 1;
        let mut completed = self.completed.subscribe();
        self.flush_signal.notify_one();

        let wait = async {
            tokio::select! {
                result = completed.wait_for(|done| *done >= ticket) => result.is_ok(),
                () = self.done.cancelled() => *self.completed.borrow() >= ticket,
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.unwrap_or(false),
            None => wait.await,
        }
    }

    pub(crate) fn queue_metrics(&self) -> QueueMetrics {
        self.queue.metrics()
    }

    /// Closes the queue and tells the worker to drain one final time and
    /// exit, without waiting for it.
    pub(crate) fn request_shutdown(&self) {
        self.queue.close();
        self.shutdown.cancel();
        self.flush_signal.notify_one();
    }

    /// Graceful stop: the worker drains one final time and exits.
    pub(crate) async fn stop(&self) {
        self.request_shutdown();
        self.done.cancelled().await;
    }

    /// Writes whatever a dead worker left in its queue, from the caller.
    pub(crate) async fn flush_orphaned(&self) {
        let events = self.drain_pending();
        if events.is_empty() {
            return;
        }
        let mut batch = Batch::new(events, FlushTrigger::Shutdown);
        let storage_uri = self.settings.storage_uri.read().clone();
        self.write(&mut batch, storage_uri.as_deref()).await;
    }

    pub(crate) async fn run(self: Arc<Self>) {
        let _exit = ExitGuard(&self);
        info!(mode = %self.mode, "Metrics dispatch worker started");

        loop {
            let trigger = tokio::select! {
                biased;
                () = self.kill.cancelled() => {
                    warn!(mode = %self.mode, "Metrics dispatch worker killed");
                    return;
                }
                () = self.shutdown.cancelled() => break,
                () = self.flush_signal.notified() => FlushTrigger::Explicit,
                () = tokio::time::sleep(self.settings.poll_interval) => FlushTrigger::Timer,
            };
            self.drain_cycle(trigger, false).await;
        }

        self.drain_cycle(FlushTrigger::Shutdown, true).await;
        info!(mode = %self.mode, "Metrics dispatch worker stopped");
    }

    async fn write(&self, batch: &mut Batch, storage_uri: Option<&str>) -> bool {
        match self.writer.write_batch(batch, storage_uri).await {
            Ok(summary) => {
                self.stats.batches_written.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .events_written
                    .fetch_add(summary.events as u64, Ordering::Relaxed);
                debug!(
                    batch_id = batch.id(),
                    events = summary.events,
                    records = summary.records,
                    "Metrics batch written"
                );
                true
            }
            Err(e) => {
                self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    batch_id = batch.id(),
                    events = batch.size(),
                    attempts = batch.attempts(),
                    error = %e,
                    "Failed writing metrics batch"
                );
                false
            }
        }
    }

    /// One drain: take everything queued, write it (inline or as a tracked
    /// task), wait for outstanding writes, then publish completion.
    async fn drain_cycle(self: &Arc<Self>, trigger: FlushTrigger, final_pass: bool) {
        let mut state = self.drain.lock().await;
        self.draining.store(true, Ordering::SeqCst);

        // read before draining so the drain covers every enqueue behind it
        let ticket = self.requested.load(Ordering::SeqCst);
        let drained = self.queue.drain_all();
        let storage_uri = self.settings.storage_uri.read().clone();

        if self.settings.async_enable && !final_pass {
            if !drained.is_empty() {
                let mut batch = Batch::new(drained, trigger);
                let core = Arc::clone(self);
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                state.in_flight.spawn(async move {
                    core.write(&mut batch, storage_uri.as_deref()).await;
                    core.stats.async_results.fetch_add(1, Ordering::Relaxed);
                    core.in_flight.fetch_sub(1, Ordering::SeqCst);
                });
            }
        } else {
            let state = &mut *state;
            if let Some(batch) = state.retained.as_mut() {
                batch.extend(drained, trigger);
            } else if !drained.is_empty() {
                state.retained = Some(Batch::new(drained, trigger));
            }
            if let Some(batch) = state.retained.as_mut() {
                let written = self.write(batch, storage_uri.as_deref()).await;
                if written || final_pass {
                    state.retained = None;
                }
            }
            self.retained
                .store(state.retained.is_some(), Ordering::SeqCst);
        }

        while let Some(result) = state.in_flight.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Async metrics write task failed");
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        }

        self.draining.store(false, Ordering::SeqCst);
        if final_pass {
            self.completed.send_replace(u64::MAX);
        } else if !self.shutdown.is_cancelled() {
            self.completed.send_modify(|done| *done = (*done).max(ticket));
        }
    }
}
