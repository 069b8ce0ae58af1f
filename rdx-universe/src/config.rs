//! Defines the configuration for a [`Universe`](crate::engine::Universe).
//!
//! The struct deserializes from a TOML file layered under `UNIVERSE_*`
//! environment variables using the `config` crate, so a clock's discipline
//! can be set up outside the application code.

use crate::error::UniverseError;
use crate::time::validate_resolution;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default number of decimal digits of virtual-time precision (millisecond steps).
pub const DEFAULT_TIME_RESOLUTION: i64 = 3;

/// Default capacity of the notification broadcast channel.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 256;

/// Startup settings for a universe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UniverseConfig {
    /// Digits of virtual-time precision. Must be in `0..=9`.
    pub time_resolution: i64,

    /// Start in wall-clock-synchronized mode instead of virtual time.
    pub realtime: bool,

    /// Start paused; the first `simulate` call idles until `resume()`.
    pub start_paused: bool,

    /// What to do when an activated event panics.
    pub event_failure_policy: EventFailurePolicy,

    /// Buffer size of the notification channel.
    pub notification_capacity: usize,

    /// Filter directive read by [`logging::init_from`](crate::logging::init_from).
    pub log_level: String,
}

/// How the clock reacts to an event whose task panics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventFailurePolicy {
    /// Only the failing event's task ends; the clock keeps ticking.
    #[default]
    Isolate,
    /// The running `simulate` call returns `UniverseError::EventPanicked`.
    Abort,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            time_resolution: DEFAULT_TIME_RESOLUTION,
            realtime: false,
            start_paused: false,
            event_failure_policy: EventFailurePolicy::default(),
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
            log_level: "info".to_string(),
        }
    }
}

impl UniverseConfig {
    /// Loads settings from an optional TOML file, then from `UNIVERSE_*`
    /// environment variables, which take precedence.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("UNIVERSE").try_parsing(true))
            .build()
            .context("failed to read universe configuration")?;
        let config: UniverseConfig = settings
            .try_deserialize()
            .context("failed to parse universe configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Parses settings from TOML text, with no environment layering.
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let config: UniverseConfig = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()
            .context("failed to read universe configuration")?
            .try_deserialize()
            .context("failed to parse universe configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the universe cannot run with.
    pub fn validate(&self) -> Result<(), UniverseError> {
        validate_resolution(self.time_resolution)?;
        if self.notification_capacity == 0 {
            return Err(UniverseError::InvalidConfig(
                "notification_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
