//! # Runtime
//!
//! Owns the worker pool and the timer thread, and turns effect values into
//! running fibers.
//!
//! ## Entry Points
//!
//! - [`Runtime::run_sync`]: evaluate on the calling thread. Fails with
//!   [`RunError::AsyncBoundary`] if the effect has to wait for something
//!   that cannot complete synchronously (a sleep, a join, a lock)
//! - [`Runtime::run_async`]: start a root fiber on the pool and return a
//!   [`RunHandle`], which can be waited on, polled, interrupted or awaited
//!   as a `Future`
//! - [`Runtime::run_blocking`]: `run_async` followed by `wait`
//!
//! Dropping a `Runtime` stops its workers immediately. Use
//! [`Runtime::shutdown`] to give live fibers a bounded grace period first.

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::io;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context as TaskContext, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::cause::{Cause, Defect, Exit};
use crate::config::{ConfigError, RuntimeConfig};
use crate::context::Context;
use crate::effect::node::ErasedExit;
use crate::effect::Effect;
use crate::fiber::{FiberId, FiberRef, FiberRuntime};
use crate::interpreter::SliceOutcome;
use crate::scheduler::Scheduler;
use crate::timer::{Timer, TimerHandle};

// ============================================================================
// Errors
// ============================================================================

/// How running an effect to completion went wrong.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError<E> {
    /// The effect failed with a typed error.
    #[error("effect failed: {0:?}")]
    Failure(E),
    /// The effect died with a defect.
    #[error("effect died: {0}")]
    Defect(Defect),
    /// The effect was interrupted by the given fiber.
    #[error("effect interrupted by {0}")]
    Interrupted(FiberId),
    /// `run_sync` reached an async boundary; the fiber was interrupted.
    #[error("{0} suspended on an async boundary during synchronous run")]
    AsyncBoundary(FiberId),
}

impl<E> RunError<E> {
    /// The typed failure, if any.
    pub fn failure(&self) -> Option<&E> {
        match self {
            RunError::Failure(e) => Some(e),
            _ => None,
        }
    }

    /// Returns true if this is a defect.
    pub fn is_defect(&self) -> bool {
        matches!(self, RunError::Defect(_))
    }

    /// Returns true if the effect was interrupted.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, RunError::Interrupted(_))
    }
}

impl<E> From<Cause<E>> for RunError<E> {
    fn from(cause: Cause<E>) -> Self {
        match cause {
            Cause::Fail(e) => RunError::Failure(e),
            Cause::Die(d) => RunError::Defect(d),
            Cause::Interrupt(id) => RunError::Interrupted(id),
        }
    }
}

/// Failure to construct a runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The configuration did not validate.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A worker or timer thread could not be spawned.
    #[error("failed to spawn runtime thread: {0}")]
    Spawn(#[from] io::Error),
}

fn into_run_result<A, E>(exit: Exit<A, E>) -> Result<A, RunError<E>> {
    exit.into_result().map_err(RunError::from)
}

// ============================================================================
// Shared runtime state
// ============================================================================

/// State shared by the runtime and every fiber it runs.
pub(crate) struct RuntimeInner {
    scheduler: Scheduler,
    pub(crate) timer: TimerHandle,
    timer_thread: Mutex<Timer>,
    config: RuntimeConfig,
    live_fibers: Mutex<usize>,
    all_done: Condvar,
}

impl RuntimeInner {
    /// Put a fiber on the run queue.
    pub(crate) fn schedule(&self, fiber: FiberRef) {
        self.scheduler.push(fiber);
    }

    pub(crate) fn fiber_started(&self) {
        *self.live_fibers.lock() += 1;
    }

    pub(crate) fn fiber_finished(&self) {
        let mut live = self.live_fibers.lock();
        *live = live.saturating_sub(1);
        if *live == 0 {
            self.all_done.notify_all();
        }
    }

    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn live_fibers(&self) -> usize {
        *self.live_fibers.lock()
    }

    /// Wait until no fiber is live or `deadline` passes.
    fn drain_until(&self, deadline: Instant) -> bool {
        let mut live = self.live_fibers.lock();
        while *live > 0 {
            if self.all_done.wait_until(&mut live, deadline).timed_out() {
                return *live == 0;
            }
        }
        true
    }

    fn stop(&self) {
        self.scheduler.shutdown();
        self.timer_thread.lock().shutdown();
    }
}

// ============================================================================
// Completion cell
// ============================================================================

enum Slot<T> {
    Pending(Vec<Waker>),
    Ready(T),
    Taken,
}

enum Taken<T> {
    Ready(T),
    Pending,
    Consumed,
}

/// A write-once cell that blocking waiters and async tasks can wait on.
struct Completion<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T> Completion<T> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Pending(Vec::new())),
            ready: Condvar::new(),
        }
    }

    /// Store `value` unless a value was already stored. Returns true if stored.
    fn complete(&self, value: T) -> bool {
        let wakers = {
            let mut slot = self.slot.lock();
            match &mut *slot {
                Slot::Pending(wakers) => {
                    let wakers = std::mem::take(wakers);
                    *slot = Slot::Ready(value);
                    wakers
                }
                Slot::Ready(_) | Slot::Taken => return false,
            }
        };
        self.ready.notify_all();
        for waker in wakers {
            waker.wake();
        }
        true
    }

    fn is_settled(&self) -> bool {
        !matches!(*self.slot.lock(), Slot::Pending(_))
    }

    fn take_now(slot: &mut Slot<T>) -> Taken<T> {
        match std::mem::replace(slot, Slot::Taken) {
            Slot::Ready(value) => Taken::Ready(value),
            Slot::Taken => Taken::Consumed,
            pending @ Slot::Pending(_) => {
                *slot = pending;
                Taken::Pending
            }
        }
    }

    fn try_take(&self) -> Taken<T> {
        Self::take_now(&mut self.slot.lock())
    }

    fn take_blocking(&self, deadline: Option<Instant>) -> Taken<T> {
        let mut slot = self.slot.lock();
        loop {
            match Self::take_now(&mut slot) {
                Taken::Pending => {}
                other => return other,
            }
            match deadline {
                None => self.ready.wait(&mut slot),
                Some(deadline) => {
                    if self.ready.wait_until(&mut slot, deadline).timed_out() {
                        return Self::take_now(&mut slot);
                    }
                }
            }
        }
    }

    fn poll_take(&self, cx: &mut TaskContext<'_>) -> Taken<T> {
        let mut slot = self.slot.lock();
        match Self::take_now(&mut slot) {
            Taken::Pending => {
                if let Slot::Pending(wakers) = &mut *slot {
                    if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                        wakers.push(cx.waker().clone());
                    }
                }
                Taken::Pending
            }
            other => other,
        }
    }
}

fn consumed<A, E>() -> Exit<A, E> {
    Exit::Failure(Cause::Die(Defect::new("run handle exit already taken")))
}

// ============================================================================
// Run handle
// ============================================================================

/// Handle to a root fiber started with [`Runtime::run_async`].
pub struct RunHandle<A, E> {
    fiber: FiberRef,
    completion: Arc<Completion<Exit<A, E>>>,
    _types: PhantomData<fn() -> (A, E)>,
}

impl<A, E> RunHandle<A, E> {
    /// The root fiber's identifier.
    pub fn id(&self) -> FiberId {
        self.fiber.id()
    }

    /// Returns true once the exit is available.
    pub fn is_done(&self) -> bool {
        self.completion.is_settled()
    }

    /// Request interruption of the root fiber. Does not wait.
    pub fn interrupt(&self) {
        self.fiber.request_interrupt(FiberId::EXTERNAL);
    }

    /// Block until the fiber finishes and return its exit.
    pub fn wait_exit(self) -> Exit<A, E> {
        match self.completion.take_blocking(None) {
            Taken::Ready(exit) => exit,
            Taken::Pending | Taken::Consumed => consumed(),
        }
    }

    /// Block until the fiber finishes.
    pub fn wait(self) -> Result<A, RunError<E>> {
        into_run_result(self.wait_exit())
    }

    /// Block for at most `timeout`. On timeout the handle is handed back.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Result<A, RunError<E>>, Self> {
        match self.completion.take_blocking(Some(Instant::now() + timeout)) {
            Taken::Ready(exit) => Ok(into_run_result(exit)),
            Taken::Consumed => Ok(into_run_result(consumed())),
            Taken::Pending => Err(self),
        }
    }

    /// Take the exit if the fiber has already finished.
    pub fn try_exit(&self) -> Option<Exit<A, E>> {
        match self.completion.try_take() {
            Taken::Ready(exit) => Some(exit),
            Taken::Consumed => Some(consumed()),
            Taken::Pending => None,
        }
    }
}

impl<A, E> fmt::Debug for RunHandle<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunHandle")
            .field("fiber", &self.fiber.id())
            .field("done", &self.is_done())
            .finish()
    }
}

impl<A, E> Future for RunHandle<A, E> {
    type Output = Result<A, RunError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        match self.completion.poll_take(cx) {
            Taken::Ready(exit) => Poll::Ready(into_run_result(exit)),
            Taken::Consumed => Poll::Ready(into_run_result(consumed())),
            Taken::Pending => Poll::Pending,
        }
    }
}

// ============================================================================
// Runtime
// ============================================================================

static GLOBAL_RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// A fiber runtime: a worker pool, a timer thread and their configuration.
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Start a runtime with the given configuration.
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        let scheduler = Scheduler::start(&config.scheduler)?;
        let timer = Timer::start(&config.scheduler.thread_name_prefix)?;
        tracing::debug!(
            workers = scheduler.num_workers(),
            ops_before_yield = config.scheduler.ops_before_yield,
            "runtime started"
        );
        Ok(Self {
            inner: Arc::new(RuntimeInner {
                scheduler,
                timer: timer.handle(),
                timer_thread: Mutex::new(timer),
                config,
                live_fibers: Mutex::new(0),
                all_done: Condvar::new(),
            }),
        })
    }

    /// Start a runtime configured from `MARROW_*` environment variables.
    pub fn from_env() -> Result<Self, RuntimeError> {
        Self::new(RuntimeConfig::from_env()?)
    }

    /// The process-wide runtime, started on first use.
    ///
    /// Uses the configuration installed with
    /// [`init_with_config`](crate::init_with_config) if there is one.
    pub fn global() -> Result<&'static Runtime, RuntimeError> {
        if let Some(runtime) = GLOBAL_RUNTIME.get() {
            return Ok(runtime);
        }
        let config = crate::runtime_config().cloned().unwrap_or_default();
        let runtime = Runtime::new(config)?;
        // A racing initializer may win; the loser is dropped and stopped.
        Ok(GLOBAL_RUNTIME.get_or_init(move || runtime))
    }

    /// The runtime's configuration.
    pub fn config(&self) -> &RuntimeConfig {
        self.inner.config()
    }

    /// Number of worker threads.
    pub fn num_workers(&self) -> usize {
        self.inner.scheduler.num_workers()
    }

    /// Number of fibers started on this runtime that have not finished.
    pub fn live_fibers(&self) -> usize {
        self.inner.live_fibers()
    }

    fn start_root<A, E>(&self, effect: Effect<A, E>) -> (FiberRef, Arc<Completion<Exit<A, E>>>)
    where
        A: Send + 'static,
        E: Send + 'static,
    {
        let completion = Arc::new(Completion::new());
        let publish = Arc::clone(&completion);
        let root = effect
            .exit::<Infallible>()
            .map(move |exit| {
                publish.complete(exit);
            })
            .node();

        let fiber = FiberRuntime::new(
            Arc::clone(&self.inner),
            root,
            None,
            false,
            Arc::new(Context::new()),
        );

        // Interruption skips the typed fold above; publish it from here.
        let fallback = Arc::clone(&completion);
        fiber.observe(Box::new(move |exit: &ErasedExit| {
            if let Err(cause) = exit {
                let cause = match cause {
                    Cause::Interrupt(id) => Cause::Interrupt(*id),
                    Cause::Die(defect) => Cause::Die(defect.clone()),
                    Cause::Fail(_) => Cause::Die(Defect::new("root fiber failed outside its exit")),
                };
                fallback.complete(Exit::Failure(cause));
            }
        }));
        tracing::debug!(fiber = %fiber.id(), "root fiber created");
        (fiber, completion)
    }

    /// Evaluate `effect` on the calling thread.
    ///
    /// Forked fibers still run on the pool. If the root fiber suspends, it
    /// is interrupted and [`RunError::AsyncBoundary`] is returned.
    pub fn run_sync<A, E>(&self, effect: Effect<A, E>) -> Result<A, RunError<E>>
    where
        A: Send + 'static,
        E: Send + 'static,
    {
        let (fiber, completion) = self.start_root(effect);
        loop {
            match fiber.run_slice(None) {
                SliceOutcome::Done => break,
                SliceOutcome::Yielded => continue,
                SliceOutcome::Parked => {
                    tracing::debug!(fiber = %fiber.id(), "run_sync hit an async boundary");
                    fiber.request_interrupt(FiberId::EXTERNAL);
                    return Err(RunError::AsyncBoundary(fiber.id()));
                }
            }
        }
        match completion.try_take() {
            Taken::Ready(exit) => into_run_result(exit),
            Taken::Pending | Taken::Consumed => into_run_result(consumed()),
        }
    }

    /// Start `effect` on the pool and return a handle to it.
    pub fn run_async<A, E>(&self, effect: Effect<A, E>) -> RunHandle<A, E>
    where
        A: Send + 'static,
        E: Send + 'static,
    {
        let (fiber, completion) = self.start_root(effect);
        self.inner.schedule(Arc::clone(&fiber));
        RunHandle {
            fiber,
            completion,
            _types: PhantomData,
        }
    }

    /// Run `effect` on the pool and block the calling thread until it finishes.
    pub fn run_blocking<A, E>(&self, effect: Effect<A, E>) -> Result<A, RunError<E>>
    where
        A: Send + 'static,
        E: Send + 'static,
    {
        self.run_async(effect).wait()
    }

    /// Wait up to the configured shutdown timeout for live fibers to finish,
    /// then stop. Returns true if every fiber finished in time.
    pub fn shutdown(self) -> bool {
        let deadline = Instant::now() + self.inner.config.shutdown_timeout;
        let drained = self.inner.drain_until(deadline);
        if !drained {
            tracing::warn!(
                live = self.inner.live_fibers(),
                "shutdown timeout elapsed with fibers still live"
            );
        }
        drained
    }

    /// Stop immediately. Fibers that have not finished never will.
    pub fn shutdown_now(self) {
        tracing::debug!(live = self.inner.live_fibers(), "runtime stopped without draining");
        drop(self);
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("workers", &self.num_workers())
            .field("live_fibers", &self.live_fibers())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    type Eff<A> = Effect<A, String>;

    fn runtime() -> Runtime {
        Runtime::new(
            RuntimeConfig::builder()
                .num_workers(2)
                .thread_name_prefix("rt-test")
                .build()
                .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_run_sync_success() {
        let rt = runtime();
        assert_eq!(rt.run_sync(Eff::succeed(41).map(|x| x + 1)), Ok(42));
    }

    #[test]
    fn test_run_sync_failure_and_defect() {
        let rt = runtime();
        assert_eq!(
            rt.run_sync(Eff::<i32>::fail("boom".to_string())),
            Err(RunError::Failure("boom".to_string()))
        );
        let died = rt.run_sync(Eff::<i32>::die("bad state"));
        assert!(died.unwrap_err().is_defect());
    }

    #[test]
    fn test_run_sync_async_boundary() {
        let rt = runtime();
        let result = rt.run_sync(Eff::sleep(Duration::from_millis(50)).as_value(1));
        assert!(matches!(result, Err(RunError::AsyncBoundary(_))));
    }

    #[test]
    fn test_run_sync_yield_is_not_a_boundary() {
        let rt = runtime();
        assert_eq!(rt.run_sync(Eff::yield_now().as_value(3)), Ok(3));
    }

    #[test]
    fn test_run_blocking_sleep() {
        let rt = runtime();
        let start = Instant::now();
        let result = rt.run_blocking(Eff::sleep(Duration::from_millis(20)).as_value("done"));
        assert_eq!(result, Ok("done"));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_run_async_interrupt() {
        let rt = runtime();
        let handle = rt.run_async(Eff::<()>::never());
        handle.interrupt();
        let result = handle.wait();
        assert_eq!(result, Err(RunError::Interrupted(FiberId::EXTERNAL)));
    }

    #[test]
    fn test_wait_timeout_hands_back_handle() {
        let rt = runtime();
        let handle = rt.run_async(Eff::sleep(Duration::from_millis(100)).as_value(5));
        let handle = match handle.wait_timeout(Duration::from_millis(1)) {
            Err(handle) => handle,
            Ok(_) => panic!("finished too early"),
        };
        assert_eq!(handle.wait(), Ok(5));
    }

    #[test]
    fn test_try_exit() {
        let rt = runtime();
        let handle = rt.run_async(Eff::succeed(9));
        while !handle.is_done() {
            std::thread::yield_now();
        }
        assert_eq!(handle.try_exit(), Some(Exit::Success(9)));
        assert!(handle.try_exit().map(|e| e.is_defect()).unwrap_or(false));
    }

    #[test]
    fn test_graceful_shutdown() {
        let rt = runtime();
        let handle = rt.run_async(Eff::sleep(Duration::from_millis(10)));
        assert!(rt.shutdown());
        assert!(handle.is_done());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = RuntimeConfig::builder().num_workers(0).build_unchecked();
        assert!(matches!(Runtime::new(config), Err(RuntimeError::Config(_))));
    }

    #[test]
    fn test_run_error_from_cause() {
        let err: RunError<&str> = Cause::Fail("x").into();
        assert_eq!(err.failure(), Some(&"x"));
        let err: RunError<&str> = Cause::Interrupt(FiberId(4)).into();
        assert!(err.is_interrupted());
        assert!(err.to_string().contains("Fiber(4)"));
    }
}
