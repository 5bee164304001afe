//! # Fibers
//!
//! Lightweight, cooperatively-scheduled executions of one effect.
//!
//! ## Design
//!
//! - M:N scheduling: many fibers share a small pool of worker threads
//! - A fiber runs until its effect completes, it suspends on an async
//!   boundary, or it yields after a fixed number of instructions
//! - Children forked by a fiber are supervised: when the parent finishes,
//!   every child still running is interrupted
//! - Interruption is cooperative. A request sets a flag that the
//!   interpreter checks before each instruction; a fiber parked on an
//!   interruptible async boundary is woken to observe it
//!
//! ## Lifecycle
//!
//! ```text
//! Created ──▶ Running ◀──▶ Suspended
//!                │
//!                ├──▶ Succeeded
//!                ├──▶ Failed
//!                └──▶ Interrupted
//! ```
//!
//! ## Technical References
//!
//! - [Tokio Scheduler Design](https://tokio.rs/blog/2019-10-scheduler)
//! - [crossbeam-deque](https://docs.rs/crossbeam-deque) for work-stealing

use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use crate::cause::{Cause, Defect, Exit};
use crate::context::Context;
use crate::effect::node::{erase, ErasedExit, ForkMode, Node, NodeRef, Value};
use crate::effect::Effect;
use crate::interpreter::ExecState;
use crate::panic::catch_defect;
use crate::runtime::RuntimeInner;

/// Unique identifier for a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(pub u64);

impl FiberId {
    /// Identifier used for interruptions requested from outside any fiber.
    pub const EXTERNAL: FiberId = FiberId(0);

    /// Create a new fiber ID.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber({})", self.0)
    }
}

/// Global fiber ID counter.
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a new unique fiber ID.
pub fn next_fiber_id() -> FiberId {
    FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
}

/// Fiber execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FiberState {
    /// Created but not yet picked up by a worker.
    #[default]
    Created,
    /// Currently executing on a worker thread.
    Running,
    /// Parked on an async boundary.
    Suspended,
    /// Completed with a value.
    Succeeded,
    /// Completed with a failure or defect.
    Failed,
    /// Completed because it was interrupted.
    Interrupted,
}

impl FiberState {
    /// Returns true once the fiber can no longer run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FiberState::Succeeded | FiberState::Failed | FiberState::Interrupted
        )
    }
}

// ============================================================================
// Runtime fiber
// ============================================================================

pub(crate) type FiberRef = Arc<FiberRuntime>;

type Observer = Box<dyn FnOnce(&ErasedExit) + Send>;

#[derive(Default)]
struct Status {
    state: FiberState,
    /// Memoized exit. Temporarily taken while observers are notified.
    exit: Option<ErasedExit>,
    observers: Vec<Observer>,
    children: Vec<FiberRef>,
    parked: Option<Arc<AsyncSlot>>,
}

/// The scheduler-facing half of a fiber.
pub(crate) struct FiberRuntime {
    id: FiberId,
    parent_id: Option<FiberId>,
    parent: Option<Weak<FiberRuntime>>,
    pub(crate) runtime: Arc<RuntimeInner>,
    interrupt_requested: AtomicBool,
    interrupt_delivered: AtomicBool,
    interruptor: AtomicU64,
    pub(crate) exec: Mutex<ExecState>,
    pub(crate) wakeup: Mutex<Option<NodeRef>>,
    status: Mutex<Status>,
}

impl FiberRuntime {
    pub(crate) fn new(
        runtime: Arc<RuntimeInner>,
        root: NodeRef,
        parent: Option<&FiberRef>,
        supervised: bool,
        context: Arc<Context>,
    ) -> FiberRef {
        runtime.fiber_started();
        Arc::new(Self {
            id: next_fiber_id(),
            parent_id: parent.map(|p| p.id),
            parent: parent.filter(|_| supervised).map(Arc::downgrade),
            runtime,
            interrupt_requested: AtomicBool::new(false),
            interrupt_delivered: AtomicBool::new(false),
            interruptor: AtomicU64::new(FiberId::EXTERNAL.0),
            exec: Mutex::new(ExecState::new(root, context)),
            wakeup: Mutex::new(None),
            status: Mutex::new(Status::default()),
        })
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    pub(crate) fn state(&self) -> FiberState {
        self.status.lock().state
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    pub(crate) fn interruptor(&self) -> FiberId {
        FiberId(self.interruptor.load(Ordering::SeqCst))
    }

    /// Ask the fiber to stop. Idempotent; a finished fiber ignores it.
    pub(crate) fn request_interrupt(self: &Arc<Self>, by: FiberId) {
        if self.is_done() {
            return;
        }
        if !self.interrupt_requested.load(Ordering::SeqCst) {
            self.interruptor.store(by.0, Ordering::SeqCst);
            self.interrupt_requested.store(true, Ordering::SeqCst);
            tracing::trace!(fiber = %self.id, by = %by, "interrupt requested");
        }
        if self.interrupt_delivered.load(Ordering::SeqCst) {
            return;
        }
        let parked = self.status.lock().parked.clone();
        if let Some(slot) = parked {
            if slot.interruptible {
                let _ = Resumer { slot }.resume(Arc::new(Node::DeliverInterrupt));
            }
        }
    }

    /// Claim a pending interruption for delivery. True at most once.
    pub(crate) fn take_interrupt(&self) -> bool {
        self.interrupt_requested.load(Ordering::SeqCst)
            && self
                .interrupt_delivered
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    pub(crate) fn mark_interrupt_delivered(&self) {
        self.interrupt_delivered.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_interrupting(&self) -> bool {
        self.interrupt_delivered.load(Ordering::SeqCst)
    }

    pub(crate) fn interrupt_pending(&self) -> bool {
        self.interrupt_requested.load(Ordering::SeqCst)
            && !self.interrupt_delivered.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_running(&self) {
        let mut status = self.status.lock();
        if !status.state.is_terminal() {
            status.state = FiberState::Running;
        }
    }

    fn mark_parked(&self, slot: Arc<AsyncSlot>) {
        let mut status = self.status.lock();
        status.state = FiberState::Suspended;
        status.parked = Some(slot);
    }

    /// Hand the fiber its next instruction and put it back on the run queue.
    fn wake(self: &Arc<Self>, next: NodeRef) {
        *self.wakeup.lock() = Some(next);
        self.status.lock().parked = None;
        self.runtime.schedule(Arc::clone(self));
    }

    /// Call `observer` with the fiber's exit once it is known.
    pub(crate) fn observe(&self, observer: Observer) {
        let mut status = self.status.lock();
        if !status.state.is_terminal() {
            status.observers.push(observer);
            return;
        }
        match status.exit.take() {
            // Another thread is notifying observers and will drain this one.
            None => status.observers.push(observer),
            Some(exit) => {
                drop(status);
                let _ = catch_defect(|| observer(&exit));
                self.settle(exit);
            }
        }
    }

    /// Store the exit, first notifying every observer registered so far.
    fn settle(&self, exit: ErasedExit) {
        loop {
            let observers = {
                let mut status = self.status.lock();
                if status.observers.is_empty() {
                    status.exit = Some(exit);
                    return;
                }
                std::mem::take(&mut status.observers)
            };
            for observer in observers {
                let _ = catch_defect(|| observer(&exit));
            }
        }
    }

    pub(crate) fn complete(self: &Arc<Self>, exit: ErasedExit) {
        let state = match &exit {
            Ok(_) => FiberState::Succeeded,
            Err(Cause::Interrupt(_)) => FiberState::Interrupted,
            Err(_) => FiberState::Failed,
        };
        let children = {
            let mut status = self.status.lock();
            status.state = state;
            status.parked = None;
            std::mem::take(&mut status.children)
        };
        tracing::debug!(fiber = %self.id, parent = ?self.parent_id, ?state, "fiber finished");

        for child in children {
            child.request_interrupt(self.id);
        }
        self.settle(exit);

        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent.forget_child(self.id);
        }
        self.runtime.fiber_finished();
    }

    /// Start `root` on a new fiber attached according to `mode`.
    pub(crate) fn fork(
        self: &Arc<Self>,
        root: NodeRef,
        mode: &ForkMode,
        context: Arc<Context>,
    ) -> FiberRef {
        let supervised = matches!(mode, ForkMode::Child);
        let child = FiberRuntime::new(
            Arc::clone(&self.runtime),
            root,
            Some(self),
            supervised,
            context,
        );
        match mode {
            ForkMode::Child => self.status.lock().children.push(Arc::clone(&child)),
            ForkMode::Daemon => {}
            ForkMode::Scoped(scope) => scope.adopt(&child, self.id),
        }
        tracing::trace!(fiber = %child.id, parent = %self.id, "fiber forked");
        self.runtime.schedule(Arc::clone(&child));
        child
    }

    fn forget_child(&self, id: FiberId) {
        self.status.lock().children.retain(|child| child.id != id);
    }

    pub(crate) fn child_count(&self) -> usize {
        self.status.lock().children.len()
    }
}

impl fmt::Debug for FiberRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberRuntime")
            .field("id", &self.id)
            .field("parent", &self.parent_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Node that completes once `fiber` has finished, whatever its exit.
pub(crate) fn await_done(fiber: FiberRef) -> NodeRef {
    Node::suspended(
        move |resumer| {
            fiber.observe(Box::new(move |_: &ErasedExit| {
                let _ = resumer.resume(Node::unit());
            }))
        },
        false,
    )
}

/// Interrupt every fiber now and return a node that waits for all of them.
pub(crate) fn interrupt_and_await(fibers: Vec<FiberRef>, by: FiberId) -> NodeRef {
    for fiber in &fibers {
        fiber.request_interrupt(by);
    }
    let mut node = Node::unit();
    for fiber in fibers {
        node = Node::then_once(node, move |_| await_done(fiber));
    }
    Node::uninterruptible(node)
}

// ============================================================================
// Async boundaries
// ============================================================================

enum SlotState {
    /// The registration callback is still running on the fiber's worker.
    Registering,
    /// The fiber is parked waiting for a resume.
    Parked,
    /// Resumed before the registration callback returned.
    Resumed(NodeRef),
    /// Resumed after parking, or abandoned.
    Finished,
}

/// One suspension of one fiber. Resumed at most once.
pub(crate) struct AsyncSlot {
    fiber: FiberRef,
    interruptible: bool,
    state: Mutex<SlotState>,
}

impl AsyncSlot {
    pub(crate) fn new(fiber: FiberRef, interruptible: bool) -> Arc<Self> {
        Arc::new(Self {
            fiber,
            interruptible,
            state: Mutex::new(SlotState::Registering),
        })
    }

    pub(crate) fn interruptible(&self) -> bool {
        self.interruptible
    }

    /// Called once registration returns. `Some` means the fiber was resumed
    /// synchronously and continues inline; `None` means it is now parked.
    pub(crate) fn settle_registration(self: &Arc<Self>) -> Option<NodeRef> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, SlotState::Finished) {
            SlotState::Resumed(next) => Some(next),
            SlotState::Registering => {
                *state = SlotState::Parked;
                // Lock order: slot, then status.
                self.fiber.mark_parked(Arc::clone(self));
                None
            }
            SlotState::Parked | SlotState::Finished => {
                Some(Node::die(Defect::new("async boundary settled twice")))
            }
        }
    }

    pub(crate) fn abandon(&self) {
        *self.state.lock() = SlotState::Finished;
    }
}

/// Capability to resume a fiber suspended on an async boundary.
#[derive(Clone)]
pub(crate) struct Resumer {
    slot: Arc<AsyncSlot>,
}

impl Resumer {
    pub(crate) fn new(slot: Arc<AsyncSlot>) -> Self {
        Self { slot }
    }

    /// Continue the fiber with `next`. The node is handed back if this
    /// boundary was already resumed or interrupted.
    pub(crate) fn resume(&self, next: NodeRef) -> Result<(), NodeRef> {
        let mut state = self.slot.state.lock();
        match *state {
            SlotState::Registering => {
                *state = SlotState::Resumed(next);
                Ok(())
            }
            SlotState::Parked => {
                *state = SlotState::Finished;
                drop(state);
                self.slot.fiber.wake(next);
                Ok(())
            }
            SlotState::Resumed(_) | SlotState::Finished => Err(next),
        }
    }

    pub(crate) fn succeed(&self, value: Value) -> bool {
        self.resume(Node::value(value)).is_ok()
    }

    pub(crate) fn is_settled(&self) -> bool {
        matches!(
            *self.slot.state.lock(),
            SlotState::Resumed(_) | SlotState::Finished
        )
    }

    pub(crate) fn fiber_id(&self) -> FiberId {
        self.slot.fiber.id
    }

    /// Resume with unit once `deadline` passes. The timer does not keep the
    /// fiber alive: a fiber that finishes first is released right away.
    pub(crate) fn wake_at(&self, deadline: Instant) {
        self.slot.fiber.runtime.timer.schedule(deadline, self.downgrade());
    }

    pub(crate) fn downgrade(&self) -> WeakResumer {
        WeakResumer {
            slot: Arc::downgrade(&self.slot),
        }
    }
}

/// A [`Resumer`] that does not own its boundary.
///
/// A parked fiber and its slot keep each other alive until the slot is
/// resumed, so upgrading succeeds exactly while the fiber still waits here.
pub(crate) struct WeakResumer {
    slot: Weak<AsyncSlot>,
}

impl WeakResumer {
    pub(crate) fn upgrade(&self) -> Option<Resumer> {
        self.slot.upgrade().map(|slot| Resumer { slot })
    }

    pub(crate) fn is_live(&self) -> bool {
        self.slot.strong_count() > 0
    }
}

/// Snapshot of the running fiber handed to `Node::WithFiber` builders.
pub(crate) struct FiberInfo {
    pub(crate) fiber: FiberRef,
    pub(crate) interruptible: bool,
    pub(crate) context: Arc<Context>,
}

impl FiberInfo {
    pub(crate) fn id(&self) -> FiberId {
        self.fiber.id
    }

    pub(crate) fn fork(&self, root: NodeRef, mode: ForkMode) -> FiberRef {
        self.fiber.fork(root, &mode, Arc::clone(&self.context))
    }
}

// ============================================================================
// Typed handle
// ============================================================================

/// A handle to a forked fiber running an `Effect<A, E>`.
pub struct Fiber<A, E> {
    inner: FiberRef,
    _types: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Fiber<A, E> {
    fn clone(&self) -> Self {
        Self::from_runtime(Arc::clone(&self.inner))
    }
}

impl<A, E> fmt::Debug for Fiber<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl<A, E> Fiber<A, E> {
    pub(crate) fn from_runtime(inner: FiberRef) -> Self {
        Self {
            inner,
            _types: PhantomData,
        }
    }

    /// The fiber's identifier.
    pub fn id(&self) -> FiberId {
        self.inner.id
    }

    /// Current lifecycle state.
    pub fn status(&self) -> FiberState {
        self.inner.state()
    }

    /// Returns true once the fiber has finished.
    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    /// Request interruption without waiting for the fiber to finish.
    pub fn interrupt_fork<E2: Send + 'static>(&self) -> Effect<(), E2> {
        let fiber = Arc::clone(&self.inner);
        Effect::with_fiber(move |info| {
            fiber.request_interrupt(info.id());
            Effect::unit()
        })
    }
}

impl<A, E> Fiber<A, E>
where
    A: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Wait for the fiber and observe its exit. Never fails.
    pub fn await_exit<E2: Send + 'static>(&self) -> Effect<Exit<A, E>, E2> {
        let fiber = Arc::clone(&self.inner);
        Effect::from_ref(Node::suspended(
            move |resumer| {
                fiber.observe(Box::new(move |exit: &ErasedExit| {
                    let _ = resumer.resume(Node::value(erase(clone_exit::<A, E>(exit))));
                }))
            },
            false,
        ))
    }

    /// Wait for the fiber and adopt its outcome.
    pub fn join(&self) -> Effect<A, E> {
        self.await_exit::<E>().flat_map(|exit| match exit {
            Exit::Success(a) => Effect::ready(a),
            Exit::Failure(cause) => Effect::ready_cause(cause),
        })
    }

    /// Interrupt the fiber and wait until it has finished.
    pub fn interrupt<E2: Send + 'static>(&self) -> Effect<Exit<A, E>, E2> {
        let fiber = Arc::clone(&self.inner);
        let await_exit = self.await_exit::<E2>();
        Effect::with_fiber(move |info| {
            fiber.request_interrupt(info.id());
            await_exit.clone()
        })
    }

    /// The exit, if the fiber has already finished.
    pub fn poll(&self) -> Option<Exit<A, E>> {
        let status = self.inner.status.lock();
        status.exit.as_ref().map(clone_exit::<A, E>)
    }
}

fn clone_exit<A: Clone + 'static, E: Clone + 'static>(exit: &ErasedExit) -> Exit<A, E> {
    match exit {
        Ok(value) => match (**value).downcast_ref::<A>() {
            Some(a) => Exit::Success(a.clone()),
            None => Exit::Failure(Cause::Die(Defect::type_mismatch(type_name::<A>()))),
        },
        Err(Cause::Fail(error)) => match (**error).downcast_ref::<E>() {
            Some(e) => Exit::Failure(Cause::Fail(e.clone())),
            None => Exit::Failure(Cause::Die(Defect::type_mismatch(type_name::<E>()))),
        },
        Err(Cause::Die(defect)) => Exit::Failure(Cause::Die(defect.clone())),
        Err(Cause::Interrupt(id)) => Exit::Failure(Cause::Interrupt(*id)),
    }
}

// ============================================================================
// Scopes
// ============================================================================

#[derive(Default)]
struct ScopeState {
    closed: bool,
    fibers: Vec<FiberRef>,
}

/// A supervision scope that fibers can be forked into.
///
/// Closing the scope interrupts every fiber still running in it and waits
/// for them to finish. Fibers forked into a closed scope are interrupted
/// immediately.
#[derive(Clone, Default)]
pub struct FiberScope {
    inner: Arc<Mutex<ScopeState>>,
}

impl FiberScope {
    /// Create an open scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Effect that creates an open scope.
    pub fn make<E: Send + 'static>() -> Effect<FiberScope, E> {
        Effect::sync(FiberScope::new)
    }

    /// Run `f` with a fresh scope that is closed when `f`'s effect finishes.
    pub fn scoped<A, E, F>(f: F) -> Effect<A, E>
    where
        A: Send + 'static,
        E: Send + 'static,
        F: Fn(FiberScope) -> Effect<A, E> + Send + Sync + 'static,
    {
        Self::make::<E>().flat_map(move |scope| f(scope.clone()).ensuring(scope.close()))
    }

    /// Returns true once the scope has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of fibers in the scope that have not finished.
    pub fn live_fibers(&self) -> usize {
        let state = self.inner.lock();
        state.fibers.iter().filter(|fiber| !fiber.is_done()).count()
    }

    /// Close the scope, interrupting and awaiting its fibers.
    pub fn close<E: Send + 'static>(&self) -> Effect<(), E> {
        let inner = Arc::clone(&self.inner);
        Effect::from_node(Node::WithFiber(Arc::new(move |info: &FiberInfo| {
            let fibers = {
                let mut state = inner.lock();
                state.closed = true;
                std::mem::take(&mut state.fibers)
            };
            interrupt_and_await(fibers, info.id())
        })))
    }

    pub(crate) fn adopt(&self, fiber: &FiberRef, by: FiberId) {
        let mut state = self.inner.lock();
        if state.closed {
            drop(state);
            fiber.request_interrupt(by);
            return;
        }
        state.fibers.retain(|f| !f.is_done());
        state.fibers.push(Arc::clone(fiber));
    }
}

impl fmt::Debug for FiberScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("FiberScope")
            .field("closed", &state.closed)
            .field("fibers", &state.fibers.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fiber_id_generation() {
        let id1 = next_fiber_id();
        let id2 = next_fiber_id();
        assert_ne!(id1, id2);
        assert!(id2.0 > id1.0);
        assert_ne!(id1, FiberId::EXTERNAL);
    }

    #[test]
    fn test_fiber_id_display() {
        assert_eq!(FiberId::new(12).to_string(), "Fiber(12)");
        assert_eq!(FiberId(3).as_u64(), 3);
    }

    #[test]
    fn test_fiber_state_default() {
        assert_eq!(FiberState::default(), FiberState::Created);
    }

    #[test]
    fn test_fiber_state_terminal() {
        assert!(!FiberState::Created.is_terminal());
        assert!(!FiberState::Running.is_terminal());
        assert!(!FiberState::Suspended.is_terminal());
        assert!(FiberState::Succeeded.is_terminal());
        assert!(FiberState::Failed.is_terminal());
        assert!(FiberState::Interrupted.is_terminal());
    }

    #[test]
    fn test_clone_exit() {
        let ok: ErasedExit = Ok(erase(5i32));
        assert_eq!(clone_exit::<i32, String>(&ok), Exit::Success(5));

        let fail: ErasedExit = Err(Cause::Fail(erase("bad".to_string())));
        assert_eq!(
            clone_exit::<i32, String>(&fail),
            Exit::Failure(Cause::Fail("bad".to_string()))
        );

        let mismatch: ErasedExit = Ok(erase("str"));
        assert!(clone_exit::<i32, String>(&mismatch).is_defect());
    }

    #[test]
    fn test_scope_starts_open() {
        let scope = FiberScope::new();
        assert!(!scope.is_closed());
        assert_eq!(scope.live_fibers(), 0);
    }
}
