//! # Universe
//!
//! A discrete-event simulation clock for Rust.
//!
//! A [`Universe`](engine::Universe) owns virtual time and advances it in
//! discrete ticks. At the top of each tick it starts every event scheduled
//! for activation, then walks the priority bands in increasing order so that
//! work within one tick is ordered by priority, and finally advances time.
//!
//! ## Core Concepts
//!
//! - **Tick**: one iteration of the clock. Pending events are started and
//!   every priority band is visited once.
//! - **Priority band**: an integer level in `0..=max_event_priority`. The
//!   clock yields once per band, and an event can wait for its band with
//!   [`Universe::wait_for_band`](engine::Universe::wait_for_band).
//! - **Virtual time**: advances by exactly one `time_step` (`10^-resolution`
//!   seconds) per tick, independent of how fast the host runs.
//! - **Real time**: clock time follows the wall clock since the run started.
//! - **Cooperative tasks**: every activated event runs as a local task on
//!   one thread. Events must yield; none is ever preempted.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use universe::prelude::*;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let config = UniverseConfig::load(None)?;
//!     universe::logging::init_from(&config)?;
//!
//!     let universe = Universe::new(config)?;
//!
//!     universe.schedule_for_activation(event_fn(1, |universe| async move {
//!         universe.wait_for_band(1).await;
//!         println!("Band 1 serviced at {}", universe.time());
//!     }));
//!
//!     let local = tokio::task::LocalSet::new();
//!     local.run_until(universe.simulate(SimTime::from_millis(10))).await?;
//!     Ok(())
//! }
//! ```

pub const ENGINE_NAME: &str = "Universe";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod components;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod time;

#[cfg(test)]
mod tests;

/// A prelude module for easy importing of the most common Universe types.
pub mod prelude {
    pub use crate::components::event::{event_fn, Event, EventFuture, FnEvent};
    pub use crate::config::{EventFailurePolicy, UniverseConfig};
    pub use crate::engine::{RunStatus, Universe};
    pub use crate::error::UniverseError;
    pub use crate::events::UniverseEvent;
    pub use crate::time::{ManualTimeSource, SimTime, SystemTimeSource, TimeSource};
}
