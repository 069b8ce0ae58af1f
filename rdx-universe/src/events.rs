//! Notifications broadcast by the universe while it runs.
//!
//! Subscribe with [`Universe::subscribe`](crate::engine::Universe::subscribe).
//! Notifications are informational: the clock never waits for a receiver,
//! and a receiver that falls behind sees `RecvError::Lagged`.

use crate::time::SimTime;
use chrono::{DateTime, Utc};

/// Something that happened to the clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UniverseEvent {
    /// Fired when a `simulate` call begins.
    SimulationStarted {
        at: DateTime<Utc>,
        from: SimTime,
        until: SimTime,
    },
    /// Fired at the end of every tick.
    TickCompleted {
        /// Ticks completed over the universe's lifetime, this one included.
        tick: u64,
        /// Clock time at the end of the tick.
        time: SimTime,
        /// How many pending events were started at the top of the tick.
        activated: usize,
        /// How many priority bands the tick walked through.
        bands_visited: u32,
    },
    Paused,
    Resumed,
    RealtimeChanged { enabled: bool },
    ResolutionChanged { resolution: u32, time_step: SimTime },
    /// An activated event panicked and its task was torn down.
    EventPanicked { tick: u64 },
    /// Fired when a `simulate` call returns successfully.
    SimulationFinished {
        at: DateTime<Utc>,
        time: SimTime,
        ticks: u64,
    },
}
