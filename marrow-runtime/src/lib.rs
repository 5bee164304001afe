//! # Marrow Runtime Library
//!
//! Marrow is a small effect-composition kernel:
//!
//! - **Effects**: lazy, immutable descriptions of computations with typed
//!   failures, defects and interruption as distinct outcomes
//! - **Fibers**: M:N cooperative scheduling with work-stealing, structured
//!   supervision and interruption
//! - **Shared state**: `Ref`, `SynchronizedRef`, a fiber-aware `Semaphore`
//!   and `Queue`
//! - **Schedules**: recurrence policies driving `repeat` and `retry`
//! - **Streams**: lazy chunked sequences consumed by sinks
//!
//! ## Technical Standards
//!
//! Implementation follows these standards:
//!
//! - **Work Stealing**: Based on Chase-Lev deque per
//!   [crossbeam-deque](https://docs.rs/crossbeam-deque)
//! - **Timers**: Dedicated timer thread fed over
//!   [crossbeam-channel](https://docs.rs/crossbeam-channel)
//! - **Logging**: Structured events via [tracing](https://docs.rs/tracing)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        MARROW RUNTIME                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │   Effects    │  │  Schedules   │  │   Streams    │           │
//! │  │ (effect/)    │  │(schedule.rs) │  │  (stream/)   │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │ Interpreter  │  │  Scheduler   │  │ Refs, Queue  │           │
//! │  │  + Fibers    │  │  + Timer     │  │ + Semaphore  │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use marrow_runtime::{Concurrency, Effect};
//!
//! let program = Effect::<Vec<i32>, String>::all(
//!     (1..=3).map(|n| Effect::succeed(n * 10)),
//!     Concurrency::Unbounded,
//! );
//! assert_eq!(marrow_runtime::run_blocking(program), Ok(vec![10, 20, 30]));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cause;
pub mod config;
pub mod context;
pub mod effect;
pub mod fiber;
pub mod log;
pub mod panic;
pub mod queue;
pub mod refs;
pub mod runtime;
pub mod schedule;
pub mod stream;
pub mod sync;

pub(crate) mod interpreter;
pub(crate) mod scheduler;
pub(crate) mod timer;

// Re-exports for convenience
pub use cause::{Cause, Defect, Exit};
pub use config::{ConfigError, LogFormat, LogLevel, RuntimeConfig, RuntimeConfigBuilder};
pub use context::Context;
pub use effect::{Callback, Concurrency, Effect, Restore};
pub use fiber::{Fiber, FiberId, FiberScope, FiberState};
pub use queue::{Queue, QueueError};
pub use refs::{Ref, SynchronizedRef};
pub use runtime::{RunError, RunHandle, Runtime, RuntimeError};
pub use schedule::{Decision, Schedule};
pub use stream::{Chunk, Emit, Sink, Stream};
pub use sync::Semaphore;

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Global runtime configuration.
static RUNTIME_CONFIG: std::sync::OnceLock<RuntimeConfig> = std::sync::OnceLock::new();

/// Get the current runtime configuration.
///
/// Returns `None` if the runtime was not initialized with [`init_with_config`]
/// or [`init_from_env`].
pub fn runtime_config() -> Option<&'static RuntimeConfig> {
    RUNTIME_CONFIG.get()
}

/// Install `config` as the process-wide configuration, set up logging and
/// start the global runtime.
///
/// Only the first installed configuration counts; later calls return the
/// runtime that is already running.
///
/// # Example
///
/// ```rust,ignore
/// use marrow_runtime::{init_with_config, RuntimeConfig};
///
/// let config = RuntimeConfig::builder()
///     .num_workers(4)
///     .stream_chunk_size(1024)
///     .build()
///     .unwrap();
///
/// let runtime = init_with_config(config)?;
/// ```
pub fn init_with_config(config: RuntimeConfig) -> Result<&'static Runtime, RuntimeError> {
    config.validate()?;
    if RUNTIME_CONFIG.set(config).is_err() {
        tracing::debug!("runtime configuration already installed");
    }
    if let Some(config) = runtime_config() {
        log::init(&config.log);
    }
    Runtime::global()
}

/// Initialize the global runtime from environment variables.
///
/// Reads configuration from `MARROW_*` environment variables.
/// See [`RuntimeConfig::from_env`] for the full list of supported variables.
pub fn init_from_env() -> Result<&'static Runtime, RuntimeError> {
    init_with_config(RuntimeConfig::from_env()?)
}

/// Run `effect` on the calling thread using the global runtime.
///
/// See [`Runtime::run_sync`].
pub fn run_sync<A, E>(effect: Effect<A, E>) -> Result<A, RunError<E>>
where
    A: Send + 'static,
    E: Send + 'static,
{
    match Runtime::global() {
        Ok(runtime) => runtime.run_sync(effect),
        Err(err) => Err(RunError::Defect(Defect::new(err.to_string()))),
    }
}

/// Start `effect` on the global runtime.
///
/// See [`Runtime::run_async`].
pub fn run_async<A, E>(effect: Effect<A, E>) -> Result<RunHandle<A, E>, RuntimeError>
where
    A: Send + 'static,
    E: Send + 'static,
{
    Ok(Runtime::global()?.run_async(effect))
}

/// Run `effect` on the global runtime and block until it finishes.
///
/// See [`Runtime::run_blocking`].
pub fn run_blocking<A, E>(effect: Effect<A, E>) -> Result<A, RunError<E>>
where
    A: Send + 'static,
    E: Send + 'static,
{
    match Runtime::global() {
        Ok(runtime) => runtime.run_blocking(effect),
        Err(err) => Err(RunError::Defect(Defect::new(err.to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_runtime_runs_effects() {
        let program = Effect::<i32, String>::succeed(20)
            .map(|x| x + 1)
            .flat_map(|x| Effect::succeed(x * 2));
        assert_eq!(run_sync(program.clone()), Ok(42));
        assert_eq!(run_blocking(program.clone()), Ok(42));
        assert_eq!(run_async(program).unwrap().wait(), Ok(42));
    }

    #[test]
    fn test_global_runtime_is_shared() {
        let a = Runtime::global().unwrap();
        let b = Runtime::global().unwrap();
        assert!(std::ptr::eq(a, b));
    }

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
