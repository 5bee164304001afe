//! # Effects
//!
//! An [`Effect<A, E>`] is an immutable, lazy description of a computation
//! that either succeeds with an `A`, fails with a typed error `E`, or ends
//! with a defect or an interruption (see [`Cause`]).
//!
//! ## Design
//!
//! - Constructing or combining effects never runs anything; only a
//!   [`Runtime`](crate::Runtime) entry point does
//! - An effect is a shared pointer to an instruction tree, so cloning is
//!   cheap and the same effect may be run any number of times
//! - Combinators take `self` by value and return a new effect
//! - Closures given to combinators must be `Fn + Send + Sync` because the
//!   effect may be run again, possibly on another thread
//! - A panic inside a closure becomes a defect ([`Cause::Die`])
//!
//! ## Example
//!
//! ```rust,ignore
//! use marrow_runtime::{Effect, Runtime, RuntimeConfig};
//!
//! let program = Effect::<i32, String>::succeed(20)
//!     .map(|x| x + 1)
//!     .flat_map(|x| Effect::succeed(x * 2));
//!
//! let runtime = Runtime::new(RuntimeConfig::default())?;
//! assert_eq!(runtime.run_sync(program), Ok(42));
//! ```

pub(crate) mod node;
mod concurrent;

use std::any::type_name;
use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cause::{Cause, Defect, Exit};
use crate::config::LogLevel;
use crate::context::Context;
use crate::fiber::{Fiber, FiberId, FiberInfo, FiberRef, FiberScope, Resumer};

use self::node::{erase, erase_cause, unerase, unerase_cause, Cont, ForkMode, Node, NodeRef, Value};

pub use self::concurrent::Concurrency;

/// A lazy description of a computation producing `A` or failing with `E`.
pub struct Effect<A, E = Infallible> {
    node: NodeRef,
    _types: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Effect<A, E> {
    fn clone(&self) -> Self {
        Self::from_ref(Arc::clone(&self.node))
    }
}

impl<A, E> fmt::Debug for Effect<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("instruction", &self.node.kind())
            .field("success", &type_name::<A>())
            .field("error", &type_name::<E>())
            .finish()
    }
}

impl<A, E> Effect<A, E> {
    pub(crate) fn from_ref(node: NodeRef) -> Self {
        Self {
            node,
            _types: PhantomData,
        }
    }

    pub(crate) fn from_node(node: Node) -> Self {
        Self::from_ref(Arc::new(node))
    }

    pub(crate) fn node(&self) -> NodeRef {
        Arc::clone(&self.node)
    }
}

/// Adapt a typed continuation to the erased interpreter.
fn typed<A, F>(f: F) -> impl Fn(Value) -> NodeRef + Send + Sync + 'static
where
    A: 'static,
    F: Fn(A) -> NodeRef + Send + Sync + 'static,
{
    move |value| match unerase::<A>(value) {
        Ok(a) => f(a),
        Err(defect) => Node::die(defect),
    }
}

fn typed_once<A, F>(f: F) -> impl FnOnce(Value) -> NodeRef + Send + 'static
where
    A: 'static,
    F: FnOnce(A) -> NodeRef + Send + 'static,
{
    move |value| match unerase::<A>(value) {
        Ok(a) => f(a),
        Err(defect) => Node::die(defect),
    }
}

fn exit_node<A: Send + 'static, E: Send + 'static>(exit: Exit<A, E>) -> NodeRef {
    match exit {
        Exit::Success(a) => Node::value(erase(a)),
        Exit::Failure(cause) => Node::fail_cause(erase_cause(cause)),
    }
}

/// Run `finalizer` after `source` whatever its outcome, without
/// interruption. A defect in the finalizer replaces the original outcome.
pub(crate) fn ensuring_node(source: NodeRef, finalizer: NodeRef) -> NodeRef {
    Arc::new(Node::WithFiber(Arc::new(move |info: &FiberInfo| {
        let on_failure = Arc::clone(&finalizer);
        let on_success = Arc::clone(&finalizer);
        Node::uninterruptible(Arc::new(Node::Fold {
            source: Arc::new(Node::Interruptible(Arc::clone(&source), info.interruptible)),
            on_failure: Cont::shared(move |cause: Cause<Value>| {
                Node::then_once(Arc::clone(&on_failure), move |_| Node::fail_cause(cause))
            }),
            on_success: Cont::shared(move |value: Value| {
                Node::then_once(Arc::clone(&on_success), move |_| Node::value(value))
            }),
            finalizer: true,
        }))
    })))
}

/// Fold over the outcome of `source`. `on_failure` sees every cause the
/// interpreter lets through; interruption of the running fiber skips it.
fn fold_node<F, G>(source: NodeRef, on_failure: F, on_success: G) -> NodeRef
where
    F: Fn(Cause<Value>) -> NodeRef + Send + Sync + 'static,
    G: Fn(Value) -> NodeRef + Send + Sync + 'static,
{
    Arc::new(Node::Fold {
        source,
        on_failure: Cont::shared(on_failure),
        on_success: Cont::shared(on_success),
        finalizer: false,
    })
}

// ============================================================================
// Constructors
// ============================================================================

impl<A, E> Effect<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    /// An effect that succeeds with `value`.
    pub fn succeed(value: A) -> Self
    where
        A: Clone + Sync,
    {
        Self::from_node(Node::Succeed(Arc::new(move || erase(value.clone()))))
    }

    /// A one-shot success for values produced while an effect runs.
    pub(crate) fn ready(value: A) -> Self {
        Self::from_ref(Node::value(erase(value)))
    }

    /// A one-shot failure for causes produced while an effect runs.
    pub(crate) fn ready_cause(cause: Cause<E>) -> Self {
        Self::from_ref(Node::fail_cause(erase_cause(cause)))
    }

    /// An effect that fails with `error`.
    pub fn fail(error: E) -> Self
    where
        E: Clone + Sync,
    {
        Self::from_node(Node::Fail(Arc::new(move || Cause::Fail(erase(error.clone())))))
    }

    /// An effect that ends with `cause`.
    pub fn fail_cause(cause: Cause<E>) -> Self
    where
        E: Clone + Sync,
    {
        Self::from_node(Node::Fail(Arc::new(move || erase_cause(cause.clone()))))
    }

    /// An effect that dies with a defect.
    pub fn die(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::from_node(Node::Fail(Arc::new(move || {
            Cause::Die(Defect::new(message.clone()))
        })))
    }

    /// Run a side-effecting closure each time the effect runs.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn() -> A + Send + Sync + 'static,
    {
        Self::from_node(Node::Sync(Arc::new(move || Ok(erase(f())))))
    }

    /// Run a fallible closure; `Err` becomes a typed failure.
    pub fn try_sync<F>(f: F) -> Self
    where
        F: Fn() -> Result<A, E> + Send + Sync + 'static,
    {
        Self::from_node(Node::Sync(Arc::new(move || f().map(erase).map_err(erase))))
    }

    /// Build the effect to run lazily, each time it runs.
    pub fn suspend<F>(f: F) -> Self
    where
        F: Fn() -> Effect<A, E> + Send + Sync + 'static,
    {
        Self::from_node(Node::Suspend(Arc::new(move || f().node)))
    }

    /// An effect that never completes. It can still be interrupted.
    pub fn never() -> Self {
        Self::from_ref(Node::suspended(|_resumer| {}, false))
    }

    /// Suspend the fiber until `register`'s callback is completed.
    ///
    /// `register` runs each time the effect runs. Only the first completion
    /// of a callback counts; later ones return false.
    pub fn async_callback<F>(register: F) -> Self
    where
        F: Fn(Callback<A, E>) + Send + Sync + 'static,
    {
        Self::from_ref(Node::suspended(
            move |resumer| {
                register(Callback {
                    resumer,
                    _types: PhantomData,
                })
            },
            false,
        ))
    }

    /// Build an effect from the running fiber's state.
    pub(crate) fn with_fiber<F>(f: F) -> Self
    where
        F: Fn(&FiberInfo) -> Effect<A, E> + Send + Sync + 'static,
    {
        Self::from_node(Node::WithFiber(Arc::new(move |info: &FiberInfo| f(info).node)))
    }

    /// Read the service of type `A` from the fiber's context.
    ///
    /// Dies if no such service was provided.
    pub fn service() -> Self
    where
        A: Clone + Sync,
    {
        Self::from_node(Node::WithFiber(Arc::new(|info: &FiberInfo| {
            match info.context.get::<A>() {
                Some(service) => Node::value(erase(service.clone())),
                None => Node::die(Defect::new(format!(
                    "service `{}` was not provided",
                    type_name::<A>()
                ))),
            }
        })))
    }

    /// Run `f` uninterruptibly. The [`Restore`] it receives re-enables the
    /// interruptibility that was in effect outside.
    pub fn uninterruptible_mask<F>(f: F) -> Self
    where
        F: Fn(Restore) -> Effect<A, E> + Send + Sync + 'static,
    {
        Self::from_node(Node::WithFiber(Arc::new(move |info: &FiberInfo| {
            Node::uninterruptible(
                f(Restore {
                    interruptible: info.interruptible,
                })
                .node,
            )
        })))
    }
}

impl<E: Send + 'static> Effect<(), E> {
    /// An effect that succeeds with `()`.
    pub fn unit() -> Self {
        Self::from_node(Node::Succeed(Arc::new(|| erase(()))))
    }

    /// Suspend the fiber for `duration`. Interruptible. A duration too
    /// large for the clock suspends forever, like [`never`](Effect::never).
    pub fn sleep(duration: Duration) -> Self {
        if duration.is_zero() {
            return Self::unit();
        }
        Self::from_ref(Node::suspended(
            move |resumer| {
                // A deadline past what `Instant` can hold never arrives.
                if let Some(deadline) = Instant::now().checked_add(duration) {
                    resumer.wake_at(deadline);
                }
            },
            false,
        ))
    }

    /// Give the worker thread back to the scheduler.
    pub fn yield_now() -> Self {
        Self::from_node(Node::Yield)
    }

    /// Emit a log event tagged with the running fiber's id.
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::from_node(Node::WithFiber(Arc::new(move |info: &FiberInfo| {
            crate::log::emit(level, info.id(), &message);
            Node::unit()
        })))
    }

    /// [`Effect::log`] at info level.
    pub fn log_info(message: impl Into<String>) -> Self {
        Self::log(LogLevel::Info, message)
    }

    /// [`Effect::log`] at debug level.
    pub fn log_debug(message: impl Into<String>) -> Self {
        Self::log(LogLevel::Debug, message)
    }

    /// [`Effect::log`] at warn level.
    pub fn log_warn(message: impl Into<String>) -> Self {
        Self::log(LogLevel::Warn, message)
    }

    /// [`Effect::log`] at error level.
    pub fn log_error(message: impl Into<String>) -> Self {
        Self::log(LogLevel::Error, message)
    }
}

impl<A: Send + 'static> Effect<A, Infallible> {
    /// Use an effect that cannot fail where a typed error is expected.
    pub fn widen<E: Send + 'static>(self) -> Effect<A, E> {
        Effect::from_ref(self.node)
    }
}

impl<E: Send + 'static> Effect<FiberId, E> {
    /// The id of the fiber running this effect.
    pub fn fiber_id() -> Self {
        Self::from_node(Node::WithFiber(Arc::new(|info: &FiberInfo| {
            Node::value(erase(info.id()))
        })))
    }
}

// ============================================================================
// Combinators
// ============================================================================

impl<A, E> Effect<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    /// Transform the success value.
    pub fn map<B, F>(self, f: F) -> Effect<B, E>
    where
        B: Send + 'static,
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        Effect::from_node(Node::FlatMap(
            self.node,
            Cont::shared(typed(move |a: A| Node::value(erase(f(a))))),
        ))
    }

    /// Run the effect returned by `f` on success.
    pub fn flat_map<B, F>(self, f: F) -> Effect<B, E>
    where
        B: Send + 'static,
        F: Fn(A) -> Effect<B, E> + Send + Sync + 'static,
    {
        Effect::from_node(Node::FlatMap(
            self.node,
            Cont::shared(typed(move |a: A| f(a).node)),
        ))
    }

    /// `flat_map` for a continuation that owns state of the current run.
    pub(crate) fn flat_map_once<B, F>(self, f: F) -> Effect<B, E>
    where
        B: Send + 'static,
        F: FnOnce(A) -> Effect<B, E> + Send + 'static,
    {
        Effect::from_ref(Node::then_once(self.node, typed_once(move |a| f(a).node)))
    }

    /// Run `that` after this effect, keeping `that`'s value.
    pub fn and_then<B: Send + 'static>(self, that: Effect<B, E>) -> Effect<B, E> {
        self.zip_right(that)
    }

    /// Run `that` after this effect, keeping `that`'s value.
    pub fn zip_right<B: Send + 'static>(self, that: Effect<B, E>) -> Effect<B, E> {
        Effect::from_node(Node::FlatMap(
            self.node,
            Cont::shared(move |_: Value| that.node()),
        ))
    }

    /// Run `that` after this effect, keeping this effect's value.
    pub fn zip_left<B: Send + 'static>(self, that: Effect<B, E>) -> Self {
        Self::from_node(Node::FlatMap(
            self.node,
            Cont::shared(move |value: Value| Node::then_once(that.node(), move |_| Node::value(value))),
        ))
    }

    /// Run both effects in order and pair their values.
    pub fn zip<B: Send + 'static>(self, that: Effect<B, E>) -> Effect<(A, B), E> {
        self.zip_with(that, |a, b| (a, b))
    }

    /// Run both effects in order and combine their values with `f`.
    pub fn zip_with<B, C, F>(self, that: Effect<B, E>, f: F) -> Effect<C, E>
    where
        B: Send + 'static,
        C: Send + 'static,
        F: Fn(A, B) -> C + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Effect::from_node(Node::FlatMap(
            self.node,
            Cont::shared(typed(move |a: A| {
                let f = Arc::clone(&f);
                Node::then_once(that.node(), typed_once(move |b: B| Node::value(erase(f(a, b)))))
            })),
        ))
    }

    /// Run `f`'s effect with the success value, keeping the value.
    pub fn tap<X, F>(self, f: F) -> Self
    where
        X: Send + 'static,
        F: Fn(&A) -> Effect<X, E> + Send + Sync + 'static,
    {
        Self::from_node(Node::FlatMap(
            self.node,
            Cont::shared(typed(move |a: A| {
                let observe = f(&a).node;
                Node::then_once(observe, move |_| Node::value(erase(a)))
            })),
        ))
    }

    /// Replace the success value.
    pub fn as_value<B>(self, value: B) -> Effect<B, E>
    where
        B: Clone + Send + Sync + 'static,
    {
        self.map(move |_| value.clone())
    }

    /// Discard the success value.
    pub fn as_unit(self) -> Effect<(), E> {
        self.map(|_| ())
    }

    /// Transform the typed failure.
    pub fn map_error<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: Send + 'static,
        F: Fn(E) -> E2 + Send + Sync + 'static,
    {
        Effect::from_ref(fold_node(
            self.node,
            move |cause| match cause {
                Cause::Fail(value) => match unerase::<E>(value) {
                    Ok(e) => Node::fail_cause(Cause::Fail(erase(f(e)))),
                    Err(defect) => Node::die(defect),
                },
                other => Node::fail_cause(other),
            },
            Node::value,
        ))
    }

    /// Recover from a typed failure. Defects and interruptions pass through.
    pub fn catch_all<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: Send + 'static,
        F: Fn(E) -> Effect<A, E2> + Send + Sync + 'static,
    {
        Effect::from_ref(fold_node(
            self.node,
            move |cause| match cause {
                Cause::Fail(value) => match unerase::<E>(value) {
                    Ok(e) => f(e).node,
                    Err(defect) => Node::die(defect),
                },
                other => Node::fail_cause(other),
            },
            Node::value,
        ))
    }

    /// Recover from any cause, including defects.
    ///
    /// Interruption of the running fiber is never recovered.
    pub fn catch_all_cause<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: Send + 'static,
        F: Fn(Cause<E>) -> Effect<A, E2> + Send + Sync + 'static,
    {
        Effect::from_ref(fold_node(
            self.node,
            move |cause| f(unerase_cause::<E>(cause)).node,
            Node::value,
        ))
    }

    /// Recover from a defect. Typed failures pass through.
    pub fn catch_all_defect<F>(self, f: F) -> Self
    where
        F: Fn(Defect) -> Effect<A, E> + Send + Sync + 'static,
    {
        Self::from_ref(fold_node(
            self.node,
            move |cause| match cause {
                Cause::Die(defect) => f(defect).node,
                other => Node::fail_cause(other),
            },
            Node::value,
        ))
    }

    /// Run `that` if this effect fails with a typed error.
    pub fn or_else<E2: Send + 'static>(self, that: Effect<A, E2>) -> Effect<A, E2> {
        self.catch_all(move |_| that.clone())
    }

    /// Run `f`'s effect with the typed failure, then fail with it again.
    pub fn tap_error<X, F>(self, f: F) -> Self
    where
        X: Send + 'static,
        F: Fn(&E) -> Effect<X, E> + Send + Sync + 'static,
    {
        Self::from_ref(fold_node(
            self.node,
            move |cause| match cause {
                Cause::Fail(value) => match unerase::<E>(value) {
                    Ok(e) => {
                        let observe = f(&e).node;
                        Node::then_once(observe, move |_| Node::fail_cause(Cause::Fail(erase(e))))
                    }
                    Err(defect) => Node::die(defect),
                },
                other => Node::fail_cause(other),
            },
            Node::value,
        ))
    }

    /// Move the typed failure into the success channel.
    pub fn either<E2: Send + 'static>(self) -> Effect<Result<A, E>, E2> {
        Effect::from_ref(fold_node(
            self.node,
            |cause| match cause {
                Cause::Fail(value) => match unerase::<E>(value) {
                    Ok(e) => Node::value(erase(Err::<A, E>(e))),
                    Err(defect) => Node::die(defect),
                },
                other => Node::fail_cause(other),
            },
            typed(|a: A| Node::value(erase(Ok::<A, E>(a)))),
        ))
    }

    /// Observe the full outcome as a value.
    ///
    /// Interruption of the running fiber is never captured.
    pub fn exit<E2: Send + 'static>(self) -> Effect<Exit<A, E>, E2> {
        Effect::from_ref(fold_node(
            self.node,
            |cause| Node::value(erase(Exit::<A, E>::Failure(unerase_cause::<E>(cause)))),
            typed(|a: A| Node::value(erase(Exit::<A, E>::Success(a)))),
        ))
    }

    /// Handle both outcomes with pure functions.
    pub fn fold<B, E2, F, G>(self, on_failure: F, on_success: G) -> Effect<B, E2>
    where
        B: Send + 'static,
        E2: Send + 'static,
        F: Fn(E) -> B + Send + Sync + 'static,
        G: Fn(A) -> B + Send + Sync + 'static,
    {
        Effect::from_ref(fold_node(
            self.node,
            move |cause| match cause {
                Cause::Fail(value) => match unerase::<E>(value) {
                    Ok(e) => Node::value(erase(on_failure(e))),
                    Err(defect) => Node::die(defect),
                },
                other => Node::fail_cause(other),
            },
            typed(move |a: A| Node::value(erase(on_success(a)))),
        ))
    }

    /// Run `finalizer` after this effect, whatever its outcome, including
    /// interruption. The finalizer itself cannot be interrupted.
    pub fn ensuring<X: Send + 'static>(self, finalizer: Effect<X, Infallible>) -> Self {
        Self::from_ref(ensuring_node(self.node, finalizer.node))
    }

    /// Run `f`'s effect with this effect's exit before passing it on.
    pub fn on_exit<X, F>(self, f: F) -> Self
    where
        X: Send + 'static,
        F: Fn(&Exit<A, E>) -> Effect<X, Infallible> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let on_failure = Arc::clone(&f);
        let source = self.node;
        Self::from_node(Node::WithFiber(Arc::new(move |info: &FiberInfo| {
            let on_failure = Arc::clone(&on_failure);
            let on_success = Arc::clone(&f);
            Node::uninterruptible(Arc::new(Node::Fold {
                source: Arc::new(Node::Interruptible(Arc::clone(&source), info.interruptible)),
                on_failure: Cont::shared(move |cause: Cause<Value>| {
                    let exit = Exit::<A, E>::Failure(unerase_cause::<E>(cause));
                    let finalizer = on_failure(&exit).node;
                    Node::then_once(finalizer, move |_| exit_node(exit))
                }),
                on_success: Cont::shared(typed(move |a: A| {
                    let exit = Exit::<A, E>::Success(a);
                    let finalizer = on_success(&exit).node;
                    Node::then_once(finalizer, move |_| exit_node(exit))
                })),
                finalizer: true,
            }))
        })))
    }

    /// Run with interruption masked.
    pub fn uninterruptible(self) -> Self {
        Self::from_node(Node::Interruptible(self.node, false))
    }

    /// Run with interruption enabled, even inside a masked region.
    pub fn interruptible(self) -> Self {
        Self::from_node(Node::Interruptible(self.node, true))
    }

    /// Wait `duration` before running.
    pub fn delay(self, duration: Duration) -> Self {
        Effect::<(), E>::sleep(duration).zip_right(self)
    }

    /// Make `service` available to [`Effect::service`] while this runs.
    pub fn provide_service<S>(self, service: S) -> Self
    where
        S: Clone + Send + Sync + 'static,
    {
        Self::from_node(Node::Provide(
            self.node,
            Arc::new(move |context: &Context| context.clone().with(service.clone())),
        ))
    }

    /// Run with `context` replacing the fiber's services.
    pub fn provide_context(self, context: Context) -> Self {
        Self::from_node(Node::Provide(
            self.node,
            Arc::new(move |_: &Context| context.clone()),
        ))
    }

    fn fork_with<E2: Send + 'static>(self, mode: ForkMode) -> Effect<Fiber<A, E>, E2> {
        Effect::<FiberRef, E2>::from_node(Node::Fork(self.node, mode)).map(Fiber::from_runtime)
    }

    /// Start this effect on a child fiber. The child is interrupted when
    /// the forking fiber finishes.
    pub fn fork<E2: Send + 'static>(self) -> Effect<Fiber<A, E>, E2> {
        self.fork_with(ForkMode::Child)
    }

    /// Start this effect on a detached fiber that outlives its parent.
    pub fn fork_daemon<E2: Send + 'static>(self) -> Effect<Fiber<A, E>, E2> {
        self.fork_with(ForkMode::Daemon)
    }

    /// Start this effect on a fiber supervised by `scope`.
    pub fn fork_in<E2: Send + 'static>(self, scope: &FiberScope) -> Effect<Fiber<A, E>, E2> {
        self.fork_with(ForkMode::Scoped(scope.clone()))
    }
}

// ============================================================================
// Interruption masks and callbacks
// ============================================================================

/// Restores the interruptibility that surrounded an
/// [`uninterruptible_mask`](Effect::uninterruptible_mask).
#[derive(Debug, Clone, Copy)]
pub struct Restore {
    interruptible: bool,
}

impl Restore {
    /// Run `effect` with the outer interruptibility.
    pub fn restore<A, E>(&self, effect: Effect<A, E>) -> Effect<A, E> {
        Effect::from_node(Node::Interruptible(effect.node, self.interruptible))
    }
}

/// Completes an [`Effect::async_callback`].
pub struct Callback<A, E> {
    resumer: Resumer,
    _types: PhantomData<fn(A, E)>,
}

impl<A, E> Clone for Callback<A, E> {
    fn clone(&self) -> Self {
        Self {
            resumer: self.resumer.clone(),
            _types: PhantomData,
        }
    }
}

impl<A: Send + 'static, E: Send + 'static> Callback<A, E> {
    /// Resume with a value. Returns false if already completed.
    pub fn succeed(&self, value: A) -> bool {
        self.resumer.succeed(erase(value))
    }

    /// Resume with a typed failure. Returns false if already completed.
    pub fn fail(&self, error: E) -> bool {
        self.resumer
            .resume(Node::fail_cause(Cause::Fail(erase(error))))
            .is_ok()
    }

    /// Resume with a `Result`.
    pub fn complete(&self, result: Result<A, E>) -> bool {
        match result {
            Ok(a) => self.succeed(a),
            Err(e) => self.fail(e),
        }
    }

    /// Returns true once the callback was completed or the fiber interrupted.
    pub fn is_completed(&self) -> bool {
        self.resumer.is_settled()
    }

    /// The fiber waiting on this callback.
    pub fn fiber_id(&self) -> FiberId {
        self.resumer.fiber_id()
    }
}

impl<A, E> fmt::Debug for Callback<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("fiber", &self.resumer.fiber_id())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
