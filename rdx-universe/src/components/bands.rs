//! Walks the priority bands of a single tick.

use std::sync::atomic::{AtomicU32, Ordering};

/// Steps `current` from 0 up through `max`, inclusive.
///
/// `max` is re-read on every step, so an event that registers a higher
/// priority in the middle of a tick extends the walk. Band 0 is always
/// visited, even when no event has declared a priority. The walk ends after
/// band `u32::MAX` is serviced; `current` then stays at `u32::MAX`.
pub(crate) struct BandCursor<'a> {
    current: &'a AtomicU32,
    max: &'a AtomicU32,
    visited: u32,
    exhausted: bool,
}

impl<'a> BandCursor<'a> {
    /// Resets `current` to band 0 for a new tick.
    pub(crate) fn start(current: &'a AtomicU32, max: &'a AtomicU32) -> Self {
        current.store(0, Ordering::SeqCst);
        Self {
            current,
            max,
            visited: 0,
            exhausted: false,
        }
    }

    /// The band to service next, or `None` once `current` is past `max`.
    pub(crate) fn next_band(&self) -> Option<u32> {
        if self.exhausted {
            return None;
        }
        let band = self.current.load(Ordering::SeqCst);
        (band <= self.max.load(Ordering::SeqCst)).then_some(band)
    }

    /// Marks the current band as serviced and moves to the next one.
    pub(crate) fn advance(&mut self) {
        let stepped = self
            .current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |band| band.checked_add(1));
        self.exhausted = stepped.is_err();
        self.visited = self.visited.saturating_add(1);
    }

    pub(crate) fn visited(&self) -> u32 {
        self.visited
    }
}
