//! Erased effect instructions.
//!
//! [`Effect`](super::Effect) is a typed façade over a tree of [`Node`]s.
//! Values cross the tree as `Box<dyn Any + Send>` and are downcast at the
//! typed boundary; a failed downcast is a defect, never a panic.
//!
//! Continuations come in two flavours. `Shared` ones are plain `Fn` and can
//! run any number of times, which is what makes an effect description
//! re-runnable. `Once` ones wrap an `FnOnce` that owns a value produced
//! during the current run; invoking one twice yields a defect instead of
//! running the body again.

use std::any::{type_name, Any};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::cause::{Cause, Defect};
use crate::context::Context;
use crate::fiber::{FiberInfo, FiberScope, Resumer};

/// A type-erased runtime value.
pub(crate) type Value = Box<dyn Any + Send>;

/// Shared pointer to an instruction.
pub(crate) type NodeRef = Arc<Node>;

/// Outcome of an erased computation.
pub(crate) type ErasedExit = Result<Value, Cause<Value>>;

pub(crate) fn erase<A: Send + 'static>(value: A) -> Value {
    Box::new(value)
}

pub(crate) fn unerase<A: 'static>(value: Value) -> Result<A, Defect> {
    value
        .downcast::<A>()
        .map(|boxed| *boxed)
        .map_err(|_| Defect::type_mismatch(type_name::<A>()))
}

pub(crate) fn erase_cause<E: Send + 'static>(cause: Cause<E>) -> Cause<Value> {
    cause.map(erase)
}

pub(crate) fn unerase_cause<E: 'static>(cause: Cause<Value>) -> Cause<E> {
    match cause {
        Cause::Fail(value) => match unerase::<E>(value) {
            Ok(e) => Cause::Fail(e),
            Err(defect) => Cause::Die(defect),
        },
        Cause::Die(defect) => Cause::Die(defect),
        Cause::Interrupt(id) => Cause::Interrupt(id),
    }
}

/// A continuation from `T` to the next instruction.
pub(crate) enum Cont<T> {
    Shared(Arc<dyn Fn(T) -> NodeRef + Send + Sync>),
    Once(Arc<Mutex<Option<Box<dyn FnOnce(T) -> NodeRef + Send>>>>),
}

impl<T> Clone for Cont<T> {
    fn clone(&self) -> Self {
        match self {
            Cont::Shared(f) => Cont::Shared(Arc::clone(f)),
            Cont::Once(f) => Cont::Once(Arc::clone(f)),
        }
    }
}

impl<T: 'static> Cont<T> {
    pub(crate) fn shared<F>(f: F) -> Self
    where
        F: Fn(T) -> NodeRef + Send + Sync + 'static,
    {
        Cont::Shared(Arc::new(f))
    }

    pub(crate) fn once<F>(f: F) -> Self
    where
        F: FnOnce(T) -> NodeRef + Send + 'static,
    {
        Cont::Once(Arc::new(Mutex::new(Some(Box::new(f)))))
    }

    pub(crate) fn call(&self, input: T) -> NodeRef {
        match self {
            Cont::Shared(f) => f(input),
            Cont::Once(slot) => {
                let f = slot.lock().take();
                match f {
                    Some(f) => f(input),
                    None => Node::die(Defect::new("one-shot continuation resumed twice")),
                }
            }
        }
    }
}

/// Where a forked fiber is attached.
#[derive(Clone)]
pub(crate) enum ForkMode {
    /// Supervised by the forking fiber; interrupted when it finishes.
    Child,
    /// Unsupervised; outlives the forking fiber.
    Daemon,
    /// Supervised by an explicit scope.
    Scoped(FiberScope),
}

/// One interpreter instruction.
pub(crate) enum Node {
    /// Produce a value by running a pure thunk.
    Succeed(Arc<dyn Fn() -> Value + Send + Sync>),
    /// Fail with a cause produced by a thunk.
    Fail(Arc<dyn Fn() -> Cause<Value> + Send + Sync>),
    /// A value or cause computed during the current run. Consumed on first use.
    Exit(Mutex<Option<ErasedExit>>),
    /// Run a side-effecting closure; `Err` is a typed failure.
    Sync(Arc<dyn Fn() -> Result<Value, Value> + Send + Sync>),
    /// Build the next instruction lazily.
    Suspend(Arc<dyn Fn() -> NodeRef + Send + Sync>),
    /// Sequence: run the source, feed its value to the continuation.
    FlatMap(NodeRef, Cont<Value>),
    /// Run the source and route both outcomes. Finalizer folds also run
    /// while the fiber is being interrupted; recovery folds are skipped.
    Fold {
        source: NodeRef,
        on_failure: Cont<Cause<Value>>,
        on_success: Cont<Value>,
        finalizer: bool,
    },
    /// Suspend until the registered callback resumes the fiber.
    Async {
        register: Arc<dyn Fn(Resumer) + Send + Sync>,
        force_interruptible: bool,
    },
    /// Start the source on a new fiber; produces the fiber.
    Fork(NodeRef, ForkMode),
    /// Give the worker back to the scheduler.
    Yield,
    /// Run the source with interruption enabled or masked.
    Interruptible(NodeRef, bool),
    /// Run the source with a derived service context.
    Provide(NodeRef, Arc<dyn Fn(&Context) -> Context + Send + Sync>),
    /// Build the next instruction from the running fiber's state.
    WithFiber(Arc<dyn Fn(&FiberInfo) -> NodeRef + Send + Sync>),
    /// Deliver a pending interruption right now.
    DeliverInterrupt,
}

impl Node {
    pub(crate) fn value(value: Value) -> NodeRef {
        Arc::new(Node::Exit(Mutex::new(Some(Ok(value)))))
    }

    pub(crate) fn unit() -> NodeRef {
        Node::value(erase(()))
    }

    pub(crate) fn fail_cause(cause: Cause<Value>) -> NodeRef {
        Arc::new(Node::Exit(Mutex::new(Some(Err(cause)))))
    }

    pub(crate) fn die(defect: Defect) -> NodeRef {
        Node::fail_cause(Cause::Die(defect))
    }

    pub(crate) fn from_exit(exit: ErasedExit) -> NodeRef {
        Arc::new(Node::Exit(Mutex::new(Some(exit))))
    }

    pub(crate) fn then_once<F>(source: NodeRef, f: F) -> NodeRef
    where
        F: FnOnce(Value) -> NodeRef + Send + 'static,
    {
        Arc::new(Node::FlatMap(source, Cont::once(f)))
    }

    pub(crate) fn uninterruptible(source: NodeRef) -> NodeRef {
        Arc::new(Node::Interruptible(source, false))
    }

    pub(crate) fn suspended<F>(register: F, force_interruptible: bool) -> NodeRef
    where
        F: Fn(Resumer) + Send + Sync + 'static,
    {
        Arc::new(Node::Async {
            register: Arc::new(register),
            force_interruptible,
        })
    }

    /// Take back a value that was handed to a resumer but never consumed.
    pub(crate) fn take_ready_value(&self) -> Option<Value> {
        match self {
            Node::Exit(slot) => match slot.lock().take() {
                Some(Ok(value)) => Some(value),
                _ => None,
            },
            _ => None,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Node::Succeed(_) => "Succeed",
            Node::Fail(_) => "Fail",
            Node::Exit(_) => "Exit",
            Node::Sync(_) => "Sync",
            Node::Suspend(_) => "Suspend",
            Node::FlatMap(..) => "FlatMap",
            Node::Fold { .. } => "Fold",
            Node::Async { .. } => "Async",
            Node::Fork(..) => "Fork",
            Node::Yield => "Yield",
            Node::Interruptible(..) => "Interruptible",
            Node::Provide(..) => "Provide",
            Node::WithFiber(_) => "WithFiber",
            Node::DeliverInterrupt => "DeliverInterrupt",
        }
    }

    fn detach_source(&mut self, pending: &mut Vec<NodeRef>) {
        match self {
            Node::FlatMap(source, _)
            | Node::Fork(source, _)
            | Node::Interruptible(source, _)
            | Node::Provide(source, _)
            | Node::Fold { source, .. } => {
                pending.push(std::mem::replace(source, placeholder()));
            }
            _ => {}
        }
    }
}

fn placeholder() -> NodeRef {
    static PLACEHOLDER: OnceLock<NodeRef> = OnceLock::new();
    Arc::clone(PLACEHOLDER.get_or_init(|| Arc::new(Node::Yield)))
}

// Long `map`/`flat_map` chains nest through `source`; drop them with an
// explicit worklist so a deep chain cannot overflow the native stack.
impl Drop for Node {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        self.detach_source(&mut pending);
        while let Some(node) = pending.pop() {
            if let Ok(mut inner) = Arc::try_unwrap(node) {
                inner.detach_source(&mut pending);
            }
        }
    }
}
