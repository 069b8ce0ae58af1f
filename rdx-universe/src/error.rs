//! Error types for the universe clock.

use thiserror::Error;

/// Errors raised by the universe clock.
///
/// Every variant is a contract violation by the caller. None of them are
/// retryable; they are reported before any simulation time is consumed
/// wherever that is possible.
#[derive(Error, Debug)]
pub enum UniverseError {
    #[error("time resolution must be non-negative, got {0}")]
    NegativeResolution(i64),

    #[error("time resolution {requested} is finer than the supported maximum of {max} digits")]
    ResolutionTooFine { requested: i64, max: u32 },

    #[error("time resolution cannot change while a simulation is running")]
    ResolutionLocked,

    #[error("a simulation is already running on this universe")]
    AlreadySimulating,

    #[error("invalid time value: {0}")]
    InvalidTime(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("an event panicked during tick {tick}")]
    EventPanicked { tick: u64 },

    #[error("failed to build the simulation runtime: {0}")]
    Runtime(#[from] std::io::Error),
}
