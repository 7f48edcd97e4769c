//! Log output for binaries and tests embedding the engine.
//!
//! The engine only emits `tracing` events; nothing is printed unless the host installs a
//! subscriber, either its own or the one below.

use crate::error::{KnnError, Result};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs a stdout subscriber at `level` (`"info"`, `"shardknn=debug"`, ...).
///
/// `RUST_LOG` overrides `level` when set. Fails if a global subscriber is already installed.
pub fn init_logging(level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stdout).with_target(true))
        .try_init()
        .map_err(|e| KnnError::Config(format!("failed to initialize logging: {e}")))?;

    tracing::debug!(level, "logging initialized");
    Ok(())
}

/// Routes events to the test harness's captured output. Safe to call from every test.
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_reported() {
        init_test_logging();
        // The test subscriber already owns the global slot.
        assert!(matches!(init_logging("info"), Err(KnnError::Config(_))));
    }
}
