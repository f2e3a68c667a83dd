use super::isolated::IsolatedDispatcher;
use super::thread::ThreadDispatcher;
use super::worker::{DispatchSettings, DispatchStats, DispatchStatsSnapshot, WorkerCore};
use super::{DispatchError, DispatchMode, Dispatcher};
use crate::app::ReporterConfig;
use crate::buffer::QueueMetrics;
use crate::domain::Event;
use crate::sender::MetricsWriter;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Running(DispatchMode),
    Draining,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub mode: DispatchMode,
    pub poll_interval: Duration,
    pub flush_threshold: usize,
    pub async_enable: bool,
    pub storage_uri: Option<String>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Thread,
            poll_interval: Duration::from_secs(5),
            flush_threshold: 100,
            async_enable: false,
            storage_uri: None,
        }
    }
}

impl From<&ReporterConfig> for DispatchOptions {
    fn from(config: &ReporterConfig) -> Self {
        Self {
            mode: config.dispatch_mode,
            poll_interval: config.flush_period,
            flush_threshold: config.flush_threshold,
            async_enable: config.async_enable,
            storage_uri: config.storage_uri.clone(),
        }
    }
}

/// Owns the active dispatch worker and moves reporting from a dead isolated
/// worker to a thread worker, once.
pub struct BackgroundDispatcher {
    active: RwLock<Arc<dyn Dispatcher>>,
    state: Mutex<DispatcherState>,
    switch_lock: Mutex<()>,
    mode_switches: AtomicU64,
    since_flush: AtomicUsize,
    flush_threshold: usize,
    settings: DispatchSettings,
    writer: Arc<dyn MetricsWriter>,
    stats: Arc<DispatchStats>,
    runtime: Handle,
}

impl BackgroundDispatcher {
    /// Starts the worker. Must be called from within a tokio runtime; thread
    /// mode workers run on it.
    pub fn start(
        writer: Arc<dyn MetricsWriter>,
        options: DispatchOptions,
    ) -> Result<Self, DispatchError> {
        let runtime = Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;
        let settings = DispatchSettings {
            poll_interval: options.poll_interval,
            async_enable: options.async_enable,
            storage_uri: Arc::new(RwLock::new(options.storage_uri)),
        };
        let stats = Arc::new(DispatchStats::default());

        let core = WorkerCore::new(
            options.mode,
            settings.clone(),
            Arc::clone(&writer),
            Arc::clone(&stats),
        );
        let active: Arc<dyn Dispatcher> = match options.mode {
            DispatchMode::Thread => Arc::new(ThreadDispatcher::spawn(core, &runtime)),
            DispatchMode::Isolated => Arc::new(IsolatedDispatcher::spawn(core)?),
        };
        info!(
            mode = %options.mode,
            poll_interval_ms = options.poll_interval.as_millis() as u64,
            flush_threshold = options.flush_threshold,
            "Background dispatcher started"
        );

        Ok(Self {
            active: RwLock::new(active),
            state: Mutex::new(DispatcherState::Running(options.mode)),
            switch_lock: Mutex::new(()),
            mode_switches: AtomicU64::new(0),
            since_flush: AtomicUsize::new(0),
            flush_threshold: options.flush_threshold.max(1),
            settings,
            writer,
            stats,
            runtime,
        })
    }

    fn active(&self) -> Arc<dyn Dispatcher> {
        Arc::clone(&self.active.read())
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.lock()
    }

    pub fn mode(&self) -> DispatchMode {
        self.active().mode()
    }

    pub fn is_alive(&self) -> bool {
        matches!(self.state(), DispatcherState::Running(_)) && self.active().is_alive()
    }

    /// Number of isolated-to-thread hand-offs performed (0 or 1).
    pub fn mode_switches(&self) -> u64 {
        self.mode_switches.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn storage_uri(&self) -> Option<String> {
        self.settings.storage_uri.read().clone()
    }

    /// Applies to every batch written from now on.
    pub fn set_storage_uri(&self, storage_uri: Option<String>) {
        *self.settings.storage_uri.write() = storage_uri;
    }

    pub fn events_waiting(&self) -> bool {
        self.active().events_waiting()
    }

    /// Counters of the active worker's queue. A hand-off starts a new queue.
    pub fn queue_metrics(&self) -> QueueMetrics {
        self.active().queue_metrics()
    }

    /// Queues an event; every `flush_threshold`-th event also signals a flush.
    pub fn add_event(&self, event: Event) -> Result<(), DispatchError> {
        if !matches!(self.state(), DispatcherState::Running(_)) {
            return Err(DispatchError::Stopped);
        }
        self.ensure_alive();

        if let Err(rejected) = self.active().enqueue(event) {
            // queue closed under us by a hand-off or a stop
            self.ensure_alive();
            self.active()
                .enqueue(rejected)
                .map_err(|_| DispatchError::QueueClosed)?;
        }

        let queued = self.since_flush.fetch_add(1, Ordering::SeqCst) + 1;
        if queued >= self.flush_threshold {
            debug!(queued, "Flush threshold reached");
            self.flush();
        }
        Ok(())
    }

    pub fn flush(&self) {
        self.since_flush.store(0, Ordering::SeqCst);
        self.ensure_alive();
        self.active().flush();
    }

    /// Flushes and waits for a drain that includes everything queued so far.
    pub async fn wait_for_events(&self, timeout: Option<Duration>) -> bool {
        self.since_flush.store(0, Ordering::SeqCst);
        self.ensure_alive();
        self.active().wait_for_events(timeout).await
    }

    /// Drains and stops the worker. Later calls return immediately.
    pub async fn stop(&self) {
        // a hand-off either finishes before this or sees Draining and backs off
        let active = {
            let _switching = self.switch_lock.lock();
            let mut state = self.state.lock();
            if matches!(*state, DispatcherState::Draining | DispatcherState::Stopped) {
                return;
            }
            *state = DispatcherState::Draining;
            self.active()
        };

        if active.is_alive() {
            active.stop().await;
        } else {
            active.flush_orphaned().await;
        }

        *self.state.lock() = DispatcherState::Stopped;
        let stats = self.stats.snapshot();
        info!(
            batches = stats.batches_written,
            events = stats.events_written,
            failures = stats.write_failures,
            "Background dispatcher stopped"
        );
    }

    /// Kills an isolated worker without draining it, as if its process had
    /// died. No effect on thread workers.
    pub async fn terminate_worker(&self) {
        self.active().terminate().await;
    }

    fn ensure_alive(&self) {
        let active = self.active();
        if active.mode() == DispatchMode::Isolated
            && !active.is_alive()
            && matches!(self.state(), DispatcherState::Running(_))
        {
            self.hand_off();
        }
    }

    fn hand_off(&self) {
        let _switching = self.switch_lock.lock();
        if !matches!(self.state(), DispatcherState::Running(_)) {
            return;
        }
        let current = self.active();
        // another caller may have switched already
        if current.mode() != DispatchMode::Isolated || current.is_alive() {
            return;
        }

        let salvaged = current.drain_pending();
        let core = WorkerCore::new(
            DispatchMode::Thread,
            self.settings.clone(),
            Arc::clone(&self.writer),
            Arc::clone(&self.stats),
        );
        let replacement = ThreadDispatcher::spawn(core, &self.runtime);

        let count = salvaged.len();
        for event in salvaged {
            if replacement.enqueue(event).is_err() {
                warn!("Dropped event while resubmitting to thread dispatcher");
            }
        }
        if count > 0 {
            replacement.flush();
        }

        *self.active.write() = Arc::new(replacement);
        *self.state.lock() = DispatcherState::Running(DispatchMode::Thread);
        self.mode_switches.fetch_add(1, Ordering::SeqCst);
        warn!(
            salvaged = count,
            "Event reporting worker lost, switching to thread based reporting"
        );
    }
}

impl Drop for BackgroundDispatcher {
    /// Without an explicit `stop`, the worker still gets its final drain; it
    /// runs detached from this handle.
    fn drop(&mut self) {
        if !matches!(*self.state.get_mut(), DispatcherState::Running(_)) {
            return;
        }
        let active = Arc::clone(self.active.get_mut());
        if active.is_alive() {
            debug!(mode = %active.mode(), "Dispatcher dropped without stop, draining");
            active.shutdown();
        } else if active.events_waiting() {
            self.runtime.spawn(async move {
                active.flush_orphaned().await;
            });
        }
    }
}
