//! Logging Infrastructure
//!
//! Structured logging for the Marrow runtime, built on `tracing`.
//!
//! The runtime itself emits `debug!`/`trace!` events for fiber and worker
//! lifecycle, each carrying a `fiber` field. Effects log through
//! [`Effect::log`](crate::Effect::log), which tags the event with the id of
//! the fiber that ran it.
//!
//! Nothing is printed until a subscriber is installed, either by the host
//! application or by [`init`].
//!
//! # Example
//!
//! ```rust,ignore
//! use marrow_runtime::config::{LogConfig, LogFormat, LogLevel};
//!
//! marrow_runtime::log::init(&LogConfig {
//!     level: LogLevel::Debug,
//!     format: LogFormat::Json,
//! });
//! ```

use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogFormat, LogLevel};
use crate::fiber::FiberId;

impl LogLevel {
    /// The matching `tracing` level, or `None` for [`LogLevel::Off`].
    pub fn to_tracing(&self) -> Option<Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warn => Some(Level::WARN),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Trace => Some(Level::TRACE),
        }
    }
}

/// Install a global `tracing-subscriber` fmt subscriber.
///
/// `RUST_LOG` takes precedence over the configured level when set. Returns
/// false if a global subscriber was already installed.
pub fn init(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true);
    let installed = match config.format {
        LogFormat::Plain => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.is_ok()
}

/// Emit one event on behalf of `fiber`.
pub fn emit(level: LogLevel, fiber: FiberId, message: &str) {
    match level {
        LogLevel::Off => {}
        LogLevel::Error => tracing::error!(fiber = %fiber, "{}", message),
        LogLevel::Warn => tracing::warn!(fiber = %fiber, "{}", message),
        LogLevel::Info => tracing::info!(fiber = %fiber, "{}", message),
        LogLevel::Debug => tracing::debug!(fiber = %fiber, "{}", message),
        LogLevel::Trace => tracing::trace!(fiber = %fiber, "{}", message),
    }
}
