//! Tracing subscriber setup.
//!
//! The library itself only emits `tracing` events; binaries and test harnesses decide
//! where they go by calling [`init`] once at startup. `RUST_LOG` takes precedence over
//! the configured level so a single run can be made more verbose without editing config.

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Builds the filter used by [`init`]: `RUST_LOG` if set, otherwise the configured level.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Install the global subscriber.
///
/// Returns `false` if a subscriber was already installed (e.g. by a test harness);
/// the existing one is left untouched.
pub fn init(config: &LoggingConfig) -> bool {
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter(config));

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.is_ok()
}
