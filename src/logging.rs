//! Structured logging setup built on `tracing`.
//!
//! Logs go to stderr so stdout carries only the final run summary. The level
//! can be overridden at runtime through `RUST_LOG`.

use tracing::Level;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt};

/// Options for the logging subscriber.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LogConfig {
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
    /// Lower the default level to DEBUG.
    pub verbose: bool,
}

impl LogConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[must_use]
    pub fn default_directive(self) -> String {
        let level = if self.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        };
        format!("vmbackup={}", level.as_str().to_lowercase())
    }
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Returns [`TryInitError`] when a global subscriber is already installed.
pub fn init(config: LogConfig) -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directive()));

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    }
}
