use crate::domain::Event;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueMetrics {
    pub pushed: u64,
    pub drained: u64,
    pub rejected: u64,
    pub len: usize,
}

/// Unbounded FIFO of pending events.
///
/// Once closed, pushes hand the event back so the caller can resubmit it
/// elsewhere; whatever is still queued stays drainable.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: Mutex<VecDeque<Event>>,
    closed: AtomicBool,
    pushed: AtomicU64,
    drained: AtomicU64,
    rejected: AtomicU64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the queue length after the push.
    pub fn push(&self, event: Event) -> Result<usize, Event> {
        let mut events = self.events.lock();
        if self.closed.load(Ordering::Acquire) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(event);
        }
        events.push_back(event);
        self.pushed.fetch_add(1, Ordering::Relaxed);
        Ok(events.len())
    }

    pub fn drain_all(&self) -> Vec<Event> {
        let drained: Vec<Event> = self.events.lock().drain(..).collect();
        self.drained.fetch_add(drained.len() as u64, Ordering::Relaxed);
        drained
    }

    pub fn close(&self) {
        // taken under the lock so no push can slip in after close
        let _events = self.events.lock();
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            pushed: self.pushed.load(Ordering::Relaxed),
            drained: self.drained.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            len: self.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plot(name: &str) -> Event {
        Event::plot(name, "v", "{}", None).unwrap()
    }

    #[test]
    fn drains_in_fifo_order() {
        let queue = EventQueue::new();
        for name in ["a", "b", "c"] {
            queue.push(plot(name)).unwrap();
        }
        let drained: Vec<_> = queue
            .drain_all()
            .iter()
            .map(|e| e.metric().to_string())
            .collect();
        assert_eq!(drained, vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn closed_queue_returns_event() {
        let queue = EventQueue::new();
        queue.push(plot("kept")).unwrap();
        queue.close();

        let rejected = queue.push(plot("late")).unwrap_err();
        assert_eq!(rejected.metric(), "late");
        assert_eq!(queue.drain_all().len(), 1);

        let metrics = queue.metrics();
        assert_eq!((metrics.pushed, metrics.drained, metrics.rejected), (1, 1, 1));
    }
}
