//! Diagnostics setup.
//!
//! The universe only emits `tracing` events; installing a subscriber is left
//! to the application. [`init`] is the one-line setup most applications want.

use crate::config::UniverseConfig;
use anyhow::anyhow;
use tracing_subscriber::EnvFilter;

/// Installs a global `fmt` subscriber filtered at `level`.
///
/// `RUST_LOG`, when set, overrides `level`. Fails if `level` is not a valid
/// filter directive or if a global subscriber is already installed.
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| anyhow!("invalid log level '{level}': {e}"))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("failed to install log subscriber: {e}"))
}

/// Installs the subscriber at the configured [`UniverseConfig::log_level`].
pub fn init_from(config: &UniverseConfig) -> anyhow::Result<()> {
    init(&config.log_level)
}
