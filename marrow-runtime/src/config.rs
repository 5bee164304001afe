//! Runtime Configuration
//!
//! Configuration for the Marrow runtime. It can be set programmatically or
//! loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `MARROW_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `MARROW_NUM_WORKERS` | Number of worker threads | CPU count |
//! | `MARROW_OPS_BEFORE_YIELD` | Interpreter steps per scheduling slice | 2048 |
//! | `MARROW_WORK_STEALING` | Steal work from sibling workers ("true"/"false") | true |
//! | `MARROW_IDLE_PARK_MS` | How long an idle worker parks before re-polling | 10 |
//! | `MARROW_STREAM_CHUNK_SIZE` | Default number of elements per stream chunk | 4096 |
//! | `MARROW_SHUTDOWN_TIMEOUT_MS` | Graceful shutdown bound in milliseconds | 5000 |
//! | `MARROW_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//! | `MARROW_LOG_FORMAT` | Log output format (plain/json) | plain |
//!
//! # Example
//!
//! ```rust,ignore
//! use marrow_runtime::config::RuntimeConfig;
//!
//! // Load from environment with defaults
//! let config = RuntimeConfig::from_env()?;
//!
//! // Or use the builder pattern
//! let config = RuntimeConfig::builder()
//!     .num_workers(4)
//!     .stream_chunk_size(1024)
//!     .build()?;
//! ```

use std::env;
use std::time::Duration;

use thiserror::Error;

/// Log level for runtime logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages (default).
    #[default]
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Output format for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable single-line output.
    #[default]
    Plain,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// Parse a log format from a string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "plain" | "text" | "pretty" => Some(LogFormat::Plain),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker threads.
    /// Default: number of available CPUs.
    pub num_workers: usize,

    /// Interpreter steps a fiber may take before it yields its worker.
    /// Default: 2048.
    pub ops_before_yield: usize,

    /// Enable work stealing between worker threads.
    /// Default: true.
    pub work_stealing: bool,

    /// How long an idle worker parks before looking for work again.
    /// Default: 10ms.
    pub idle_park: Duration,

    /// Prefix for worker thread names.
    /// Default: "marrow".
    pub thread_name_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus(),
            ops_before_yield: 2048,
            work_stealing: true,
            idle_park: Duration::from_millis(10),
            thread_name_prefix: "marrow".to_string(),
        }
    }
}

/// Stream configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Elements per chunk for sources that batch their output.
    /// Default: 4096.
    pub chunk_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { chunk_size: 4096 }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Log level.
    /// Default: Info.
    pub level: LogLevel,

    /// Output format.
    /// Default: Plain.
    pub format: LogFormat,
}

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::default()` for sensible defaults, or
/// `RuntimeConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Scheduler configuration.
    pub scheduler: SchedulerConfig,

    /// Stream configuration.
    pub stream: StreamConfig,

    /// Upper bound on how long a graceful shutdown waits for live fibers.
    /// Default: 5 seconds.
    pub shutdown_timeout: Duration,

    /// Logging configuration.
    pub log: LogConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            stream: StreamConfig::default(),
            shutdown_timeout: Duration::from_secs(5),
            log: LogConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are not set keep their default values. A variable
    /// that is set but cannot be parsed is an error, as is a parsed
    /// configuration that fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Scheduler configuration
        if let Some(val) = parse_env_usize("MARROW_NUM_WORKERS")? {
            config.scheduler.num_workers = val;
        }

        if let Some(val) = parse_env_usize("MARROW_OPS_BEFORE_YIELD")? {
            config.scheduler.ops_before_yield = val;
        }

        if let Some(val) = parse_env_bool("MARROW_WORK_STEALING")? {
            config.scheduler.work_stealing = val;
        }

        if let Some(val) = parse_env_usize("MARROW_IDLE_PARK_MS")? {
            config.scheduler.idle_park = Duration::from_millis(val as u64);
        }

        // Stream configuration
        if let Some(val) = parse_env_usize("MARROW_STREAM_CHUNK_SIZE")? {
            config.stream.chunk_size = val;
        }

        if let Some(val) = parse_env_usize("MARROW_SHUTDOWN_TIMEOUT_MS")? {
            config.shutdown_timeout = Duration::from_millis(val as u64);
        }

        // Logging configuration
        if let Ok(val) = env::var("MARROW_LOG_LEVEL") {
            config.log.level = LogLevel::from_str(&val).ok_or_else(|| ConfigError::EnvParse {
                var: "MARROW_LOG_LEVEL".into(),
                message: format!("unknown log level '{}'", val),
            })?;
        }

        if let Ok(val) = env::var("MARROW_LOG_FORMAT") {
            config.log.format = LogFormat::from_str(&val).ok_or_else(|| ConfigError::EnvParse {
                var: "MARROW_LOG_FORMAT".into(),
                message: format!("unknown log format '{}'", val),
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.num_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.num_workers".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.scheduler.ops_before_yield == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.ops_before_yield".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.scheduler.idle_park.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.idle_park".into(),
                message: "must be greater than zero".into(),
            });
        }

        if self.scheduler.thread_name_prefix.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.thread_name_prefix".into(),
                message: "must not be empty".into(),
            });
        }

        if self.stream.chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "stream.chunk_size".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
    /// Environment variable parse error.
    #[error("failed to parse environment variable '{var}': {message}")]
    EnvParse {
        /// Variable name.
        var: String,
        /// Error message.
        message: String,
    },
}

/// Builder for RuntimeConfig.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.scheduler.num_workers = n;
        self
    }

    /// Set the number of interpreter steps per scheduling slice.
    pub fn ops_before_yield(mut self, ops: usize) -> Self {
        self.config.scheduler.ops_before_yield = ops;
        self
    }

    /// Enable or disable work stealing.
    pub fn work_stealing(mut self, enabled: bool) -> Self {
        self.config.scheduler.work_stealing = enabled;
        self
    }

    /// Set how long idle workers park between polls.
    pub fn idle_park(mut self, park: Duration) -> Self {
        self.config.scheduler.idle_park = park;
        self
    }

    /// Set the worker thread name prefix.
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.scheduler.thread_name_prefix = prefix.into();
        self
    }

    /// Set the default stream chunk size.
    pub fn stream_chunk_size(mut self, size: usize) -> Self {
        self.config.stream.chunk_size = size;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Set the log output format.
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.config.log.format = format;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Result<Option<usize>, ConfigError> {
    match env::var(name) {
        Err(_) => Ok(None),
        Ok(s) => s.trim().parse().map(Some).map_err(|e| ConfigError::EnvParse {
            var: name.into(),
            message: format!("{} ('{}')", e, s),
        }),
    }
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Result<Option<bool>, ConfigError> {
    match env::var(name) {
        Err(_) => Ok(None),
        Ok(s) => match s.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::EnvParse {
                var: name.into(),
                message: format!("expected a boolean, got '{}'", s),
            }),
        },
    }
}

/// Get the number of available CPUs.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert!(config.scheduler.num_workers >= 1);
        assert_eq!(config.scheduler.ops_before_yield, 2048);
        assert!(config.scheduler.work_stealing);
        assert_eq!(config.scheduler.idle_park, Duration::from_millis(10));
        assert_eq!(config.stream.chunk_size, 4096);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.log.level, LogLevel::Info);
        assert_eq!(config.log.format, LogFormat::Plain);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::builder()
            .num_workers(4)
            .ops_before_yield(64)
            .stream_chunk_size(16)
            .thread_name_prefix("test")
            .log_level(LogLevel::Debug)
            .log_format(LogFormat::Json)
            .build()
            .unwrap();

        assert_eq!(config.scheduler.num_workers, 4);
        assert_eq!(config.scheduler.ops_before_yield, 64);
        assert_eq!(config.stream.chunk_size, 16);
        assert_eq!(config.scheduler.thread_name_prefix, "test");
        assert_eq!(config.log.level, LogLevel::Debug);
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_builder_validation() {
        assert!(RuntimeConfig::builder().num_workers(0).build().is_err());
        assert!(RuntimeConfig::builder().ops_before_yield(0).build().is_err());
        assert!(RuntimeConfig::builder().stream_chunk_size(0).build().is_err());
        assert!(RuntimeConfig::builder()
            .idle_park(Duration::ZERO)
            .build()
            .is_err());
        assert!(RuntimeConfig::builder().thread_name_prefix("").build().is_err());
    }

    #[test]
    fn test_build_unchecked_skips_validation() {
        let config = RuntimeConfig::builder().num_workers(0).build_unchecked();
        assert_eq!(config.scheduler.num_workers, 0);
    }

    #[test]
    fn test_log_level_from_str() {
        assert_eq!(LogLevel::from_str("off"), Some(LogLevel::Off));
        assert_eq!(LogLevel::from_str("ERROR"), Some(LogLevel::Error));
        assert_eq!(LogLevel::from_str("warn"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_str("INFO"), Some(LogLevel::Info));
        assert_eq!(LogLevel::from_str("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::from_str("TRACE"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::from_str("invalid"), None);
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!(LogFormat::from_str("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::from_str("plain"), Some(LogFormat::Plain));
        assert_eq!(LogFormat::from_str("xml"), None);
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            field: "num_workers".into(),
            message: "must be positive".into(),
        };
        assert!(err.to_string().contains("num_workers"));
        assert!(err.to_string().contains("must be positive"));
    }

    #[test]
    fn test_parse_env_helpers() {
        env::set_var("MARROW_TEST_PARSE_USIZE", "12");
        assert_eq!(parse_env_usize("MARROW_TEST_PARSE_USIZE"), Ok(Some(12)));
        env::set_var("MARROW_TEST_PARSE_USIZE", "twelve");
        assert!(matches!(
            parse_env_usize("MARROW_TEST_PARSE_USIZE"),
            Err(ConfigError::EnvParse { .. })
        ));
        env::remove_var("MARROW_TEST_PARSE_USIZE");
        assert_eq!(parse_env_usize("MARROW_TEST_PARSE_USIZE"), Ok(None));

        env::set_var("MARROW_TEST_PARSE_BOOL", "off");
        assert_eq!(parse_env_bool("MARROW_TEST_PARSE_BOOL"), Ok(Some(false)));
        env::set_var("MARROW_TEST_PARSE_BOOL", "maybe");
        assert!(parse_env_bool("MARROW_TEST_PARSE_BOOL").is_err());
        env::remove_var("MARROW_TEST_PARSE_BOOL");
    }
}
