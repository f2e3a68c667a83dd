use crate::domain::Event;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use uuid::Uuid;

/// What made the dispatcher drain the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlushTrigger {
    Timer,
    Explicit,
    Shutdown,
}

/// Events drained together and handed to the writer as one unit.
#[derive(Debug)]
pub struct Batch {
    id: String,
    events: Vec<Event>,
    trigger: FlushTrigger,
    created_at: Instant,
    attempts: u32,
}

impl Batch {
    pub fn new(events: Vec<Event>, trigger: FlushTrigger) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            events,
            trigger,
            created_at: Instant::now(),
            attempts: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn size(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut [Event] {
        &mut self.events
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }

    pub fn trigger(&self) -> FlushTrigger {
        self.trigger
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Write attempts made with this batch so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Appends newly drained events behind the retained ones, keeping FIFO
    /// order.
    pub fn extend(&mut self, events: Vec<Event>, trigger: FlushTrigger) {
        self.events.extend(events);
        self.trigger = trigger;
    }
}
