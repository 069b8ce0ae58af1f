//! Events waiting to be started at the top of the next tick.
//!
//! This is not a future-event queue: there is no ordering by time. Whatever
//! is pending when a tick begins is drained and started, in insertion order.

use crate::components::event::Event;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub(crate) struct PendingEvents {
    queue: Mutex<Vec<Box<dyn Event>>>,
    max_priority: AtomicU32,
}

impl PendingEvents {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            max_priority: AtomicU32::new(0),
        }
    }

    // A panic while holding the lock cannot leave the queue half-mutated.
    fn queue(&self) -> MutexGuard<'_, Vec<Box<dyn Event>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an event and raises the highest priority seen, if needed.
    pub(crate) fn push(&self, event: Box<dyn Event>) {
        self.max_priority
            .fetch_max(event.priority(), Ordering::SeqCst);
        self.queue().push(event);
    }

    /// Takes every pending event, in the order they were pushed.
    pub(crate) fn drain(&self) -> Vec<Box<dyn Event>> {
        std::mem::take(&mut *self.queue())
    }

    pub(crate) fn len(&self) -> usize {
        self.queue().len()
    }

    pub(crate) fn priorities(&self) -> Vec<u32> {
        self.queue().iter().map(|event| event.priority()).collect()
    }

    /// The shared high-water mark of event priorities. It never decreases.
    pub(crate) fn max_priority(&self) -> &AtomicU32 {
        &self.max_priority
    }
}
