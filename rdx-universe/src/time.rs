//! Virtual time and the sources the universe reads wall-clock time from.
//!
//! Virtual time is a fixed-point integer: a [`SimTime`] counts nanoseconds,
//! and a time resolution of `r` decimal digits corresponds to a step of
//! `10^(9 - r)` nanoseconds. Accumulating steps is exact integer addition,
//! so the clock never drifts and never needs re-rounding between ticks.

use crate::error::UniverseError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// The finest supported time resolution, in decimal digits (nanoseconds).
pub const MAX_TIME_RESOLUTION: u32 = 9;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// A point on (or a span of) the virtual timeline, in nanoseconds.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SimTime(u64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0);
    pub const MAX: SimTime = SimTime(u64::MAX);

    pub const fn from_nanos(nanos: u64) -> Self {
        SimTime(nanos)
    }

    pub const fn from_micros(micros: u64) -> Self {
        SimTime(micros.saturating_mul(1_000))
    }

    pub const fn from_millis(millis: u64) -> Self {
        SimTime(millis.saturating_mul(1_000_000))
    }

    pub const fn from_secs(secs: u64) -> Self {
        SimTime(secs.saturating_mul(NANOS_PER_SEC))
    }

    /// Converts fractional seconds, rounding to the nearest nanosecond.
    ///
    /// Rejects NaN, infinities, negative values and values beyond [`SimTime::MAX`].
    pub fn try_from_secs_f64(secs: f64) -> Result<Self, UniverseError> {
        if !secs.is_finite() || secs < 0.0 {
            return Err(UniverseError::InvalidTime(format!(
                "{secs} is not a non-negative finite number of seconds"
            )));
        }
        let nanos = (secs * NANOS_PER_SEC as f64).round();
        if nanos >= u64::MAX as f64 {
            return Err(UniverseError::InvalidTime(format!(
                "{secs} seconds overflows the virtual timeline"
            )));
        }
        Ok(SimTime(nanos as u64))
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / NANOS_PER_SEC as f64
    }

    pub const fn saturating_add(self, rhs: SimTime) -> SimTime {
        SimTime(self.0.saturating_add(rhs.0))
    }

    pub const fn saturating_sub(self, rhs: SimTime) -> SimTime {
        SimTime(self.0.saturating_sub(rhs.0))
    }

    /// Snaps down onto the grid of the given resolution.
    pub fn floor_to(self, resolution: u32) -> SimTime {
        let step = step_for_resolution(resolution).0;
        SimTime(self.0 / step * step)
    }

    /// Snaps to the nearest point of the given resolution's grid, halves rounding up.
    pub fn round_to(self, resolution: u32) -> SimTime {
        let step = step_for_resolution(resolution).0;
        let floor = self.0 / step * step;
        if self.0 - floor >= step.div_ceil(2) {
            SimTime(floor.saturating_add(step))
        } else {
            SimTime(floor)
        }
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0 / NANOS_PER_SEC;
        let frac = self.0 % NANOS_PER_SEC;
        if frac == 0 {
            return write!(f, "{secs}s");
        }
        let digits = format!("{frac:09}");
        write!(f, "{secs}.{}s", digits.trim_end_matches('0'))
    }
}

impl From<Duration> for SimTime {
    fn from(duration: Duration) -> Self {
        SimTime(u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX))
    }
}

impl From<SimTime> for Duration {
    fn from(time: SimTime) -> Self {
        Duration::from_nanos(time.0)
    }
}

/// Checks a requested resolution and narrows it to the stored representation.
pub fn validate_resolution(resolution: i64) -> Result<u32, UniverseError> {
    if resolution < 0 {
        return Err(UniverseError::NegativeResolution(resolution));
    }
    if resolution > i64::from(MAX_TIME_RESOLUTION) {
        return Err(UniverseError::ResolutionTooFine {
            requested: resolution,
            max: MAX_TIME_RESOLUTION,
        });
    }
    Ok(resolution as u32)
}

/// The virtual-time increment of one tick at `resolution` digits.
///
/// Resolutions past [`MAX_TIME_RESOLUTION`] are clamped to it.
pub fn step_for_resolution(resolution: u32) -> SimTime {
    let digits = MAX_TIME_RESOLUTION - resolution.min(MAX_TIME_RESOLUTION);
    SimTime(10u64.pow(digits))
}

/// Where the universe reads the current wall-clock time from.
///
/// Realtime pacing and the recorded start/end timestamps go through this
/// trait so that tests can substitute a deterministic source.
pub trait TimeSource: Send + Sync {
    /// Monotonic time elapsed since an arbitrary, fixed origin.
    fn monotonic(&self) -> Duration;

    /// The current calendar time.
    fn wall_clock(&self) -> DateTime<Utc>;
}

/// Reads the operating system clocks.
#[derive(Debug, Clone)]
pub struct SystemTimeSource {
    origin: Instant,
}

impl SystemTimeSource {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SystemTimeSource {
    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A hand-driven time source.
///
/// Time only moves when [`advance`](Self::advance) or [`set`](Self::set) is
/// called, or, when built with [`with_auto_advance`](Self::with_auto_advance),
/// by a fixed amount after every monotonic read. The wall clock is the UNIX
/// epoch plus the elapsed monotonic time.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    nanos: AtomicU64,
    auto_advance: u64,
}

impl ManualTimeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call to [`TimeSource::monotonic`] moves the clock forward by `step`.
    pub fn with_auto_advance(step: Duration) -> Self {
        Self {
            nanos: AtomicU64::new(0),
            auto_advance: u64::try_from(step.as_nanos()).unwrap_or(u64::MAX),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        let _ = self
            .nanos
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_add(by))
            });
    }

    pub fn set(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.store(nanos, Ordering::SeqCst);
    }

    /// The current reading, without triggering auto-advance.
    pub fn peek(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

impl TimeSource for ManualTimeSource {
    fn monotonic(&self) -> Duration {
        let step = self.auto_advance;
        let previous = self
            .nanos
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_add(step))
            })
            .unwrap_or_else(|n| n);
        Duration::from_nanos(previous)
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        let nanos = self.nanos.load(Ordering::SeqCst);
        Utc.timestamp_nanos(i64::try_from(nanos).unwrap_or(i64::MAX))
    }
}
