//! # Logging
//!
//! Tracing subscriber wiring for the engine. The subscriber is installed
//! once per process; repeated calls (tests, embedders that already set a
//! global subscriber) are no-ops rather than panics.
//!
//! The filter directive resolves in this order:
//! 1. The `WEIR_LOG` environment variable, when set.
//! 2. [`LoggingConfig::level`] from the loaded configuration.
//!
//! With `json: true` the subscriber emits one JSON object per line,
//! suitable for log shippers; otherwise it writes the human-readable
//! format to stderr.

use std::sync::OnceLock;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggingConfig;

/// Environment variable that overrides the configured filter directive.
pub const LOG_FILTER_ENV: &str = "WEIR_LOG";

static LOGGER_INSTALLED: OnceLock<()> = OnceLock::new();

/// Install the global tracing subscriber.
///
/// Safe to call more than once; only the first call in a process does
/// anything. If another subscriber was already installed (for example by
/// a test harness), the existing one is kept.
pub fn init(config: &LoggingConfig) {
    LOGGER_INSTALLED.get_or_init(|| {
        let filter = env_filter(config);

        let already_set = if config.json {
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .json()
                        .with_target(true)
                        .with_writer(std::io::stderr)
                        .with_filter(filter),
                )
                .try_init()
                .is_err()
        } else {
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_writer(std::io::stderr)
                        .with_filter(filter),
                )
                .try_init()
                .is_err()
        };

        if already_set {
            tracing::debug!("a global tracing subscriber is already installed, keeping it");
        }
    });
}

/// Build the filter from the environment, falling back to the configured
/// directive when `WEIR_LOG` is unset or invalid.
fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new(&config.level))
}
