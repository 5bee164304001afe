//! # Effect Interpreter
//!
//! Runs a fiber's instruction tree as a loop over an explicit frame stack,
//! so deep `flat_map` chains and long-running recursion never grow the
//! native stack.
//!
//! ## Design
//!
//! The interpreter holds one register, [`Current`]: an instruction to
//! evaluate, a value to feed to the next frame, or a cause to unwind with.
//!
//! - A value pops frames until a success continuation is found
//! - A cause pops frames until a failure handler is found; while the fiber
//!   is being interrupted only finalizer handlers run
//! - Before each instruction the interruption flag is checked, but only in
//!   interruptible regions
//! - After `ops_before_yield` instructions the fiber goes back to the run
//!   queue so other fibers make progress
//!
//! ## Technical References
//!
//! - [Trampolining](https://en.wikipedia.org/wiki/Trampoline_(computing))
//! - [ZIO fiber runtime](https://zio.dev/reference/fiber/)

use std::sync::Arc;

use crate::cause::{Cause, Defect};
use crate::context::Context;
use crate::effect::node::{erase, Cont, Node, NodeRef, Value};
use crate::fiber::{AsyncSlot, FiberInfo, FiberRuntime, Resumer};
use crate::panic::catch_defect;

/// The interpreter register.
pub(crate) enum Current {
    Node(NodeRef),
    Value(Value),
    Failure(Cause<Value>),
}

/// A pending continuation on the fiber's stack.
pub(crate) enum Frame {
    Then(Cont<Value>),
    Fold {
        on_failure: Cont<Cause<Value>>,
        on_success: Cont<Value>,
        finalizer: bool,
    },
    RestoreInterruptible(bool),
    RestoreContext(Arc<Context>),
}

/// Execution state owned by whichever worker is running the fiber.
pub(crate) struct ExecState {
    current: Option<Current>,
    stack: Vec<Frame>,
    interruptible: bool,
    context: Arc<Context>,
}

impl ExecState {
    pub(crate) fn new(root: NodeRef, context: Arc<Context>) -> Self {
        Self {
            current: Some(Current::Node(root)),
            stack: Vec::new(),
            interruptible: true,
            context,
        }
    }

    /// Let go of the services of a fiber that has finished.
    fn release(&mut self) {
        self.stack.clear();
        self.context = Arc::new(Context::new());
    }
}

/// How a slice of execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SliceOutcome {
    /// The fiber finished; its exit has been published.
    Done,
    /// The fiber wants to be rescheduled.
    Yielded,
    /// The fiber is parked and will be rescheduled by whoever resumes it.
    Parked,
}

fn guarded(f: impl FnOnce() -> NodeRef) -> Current {
    match catch_defect(f) {
        Ok(next) => Current::Node(next),
        Err(defect) => Current::Failure(Cause::Die(defect)),
    }
}

impl FiberRuntime {
    /// Run the fiber until it finishes, parks, or exhausts `budget`
    /// instructions. `None` means no budget.
    pub(crate) fn run_slice(self: &Arc<Self>, budget: Option<usize>) -> SliceOutcome {
        let mut guard = self.exec.lock();
        let exec = &mut *guard;

        let resumed = self.wakeup.lock().take();
        let mut current = match resumed {
            Some(next) => Current::Node(next),
            None => match exec.current.take() {
                Some(current) => current,
                None => return SliceOutcome::Done,
            },
        };
        self.mark_running();

        let mut ops = 0usize;
        loop {
            current = match current {
                Current::Value(value) => match exec.stack.pop() {
                    None => {
                        exec.release();
                        drop(guard);
                        self.complete(Ok(value));
                        return SliceOutcome::Done;
                    }
                    Some(Frame::Then(k)) | Some(Frame::Fold { on_success: k, .. }) => {
                        guarded(move || k.call(value))
                    }
                    Some(Frame::RestoreInterruptible(flag)) => {
                        exec.interruptible = flag;
                        Current::Value(value)
                    }
                    Some(Frame::RestoreContext(context)) => {
                        exec.context = context;
                        Current::Value(value)
                    }
                },

                Current::Failure(cause) => match exec.stack.pop() {
                    None => {
                        exec.release();
                        drop(guard);
                        self.complete(Err(cause));
                        return SliceOutcome::Done;
                    }
                    Some(Frame::Then(_)) => Current::Failure(cause),
                    Some(Frame::Fold {
                        on_failure,
                        finalizer,
                        ..
                    }) => {
                        if !finalizer && self.is_interrupting() && cause.is_interrupted() {
                            Current::Failure(cause)
                        } else {
                            guarded(move || on_failure.call(cause))
                        }
                    }
                    Some(Frame::RestoreInterruptible(flag)) => {
                        exec.interruptible = flag;
                        Current::Failure(cause)
                    }
                    Some(Frame::RestoreContext(context)) => {
                        exec.context = context;
                        Current::Failure(cause)
                    }
                },

                Current::Node(node) => {
                    ops += 1;
                    if budget.is_some_and(|limit| ops > limit) {
                        exec.current = Some(Current::Node(node));
                        return SliceOutcome::Yielded;
                    }
                    if exec.interruptible && self.take_interrupt() {
                        Current::Failure(Cause::Interrupt(self.interruptor()))
                    } else {
                        match &*node {
                            Node::Succeed(f) => match catch_defect(|| f()) {
                                Ok(value) => Current::Value(value),
                                Err(defect) => Current::Failure(Cause::Die(defect)),
                            },
                            Node::Fail(f) => match catch_defect(|| f()) {
                                Ok(cause) => Current::Failure(cause),
                                Err(defect) => Current::Failure(Cause::Die(defect)),
                            },
                            Node::Exit(slot) => match slot.lock().take() {
                                Some(Ok(value)) => Current::Value(value),
                                Some(Err(cause)) => Current::Failure(cause),
                                None => Current::Failure(Cause::Die(Defect::new(
                                    "one-shot effect evaluated twice",
                                ))),
                            },
                            Node::Sync(f) => match catch_defect(|| f()) {
                                Ok(Ok(value)) => Current::Value(value),
                                Ok(Err(error)) => Current::Failure(Cause::Fail(error)),
                                Err(defect) => Current::Failure(Cause::Die(defect)),
                            },
                            Node::Suspend(f) => guarded(|| f()),
                            Node::FlatMap(source, k) => {
                                exec.stack.push(Frame::Then(k.clone()));
                                Current::Node(Arc::clone(source))
                            }
                            Node::Fold {
                                source,
                                on_failure,
                                on_success,
                                finalizer,
                            } => {
                                exec.stack.push(Frame::Fold {
                                    on_failure: on_failure.clone(),
                                    on_success: on_success.clone(),
                                    finalizer: *finalizer,
                                });
                                Current::Node(Arc::clone(source))
                            }
                            Node::Async {
                                register,
                                force_interruptible,
                            } => {
                                let slot = AsyncSlot::new(
                                    Arc::clone(self),
                                    exec.interruptible || *force_interruptible,
                                );
                                let resumer = Resumer::new(Arc::clone(&slot));
                                let register = Arc::clone(register);
                                match catch_defect(move || register(resumer)) {
                                    Err(defect) => {
                                        slot.abandon();
                                        Current::Failure(Cause::Die(defect))
                                    }
                                    Ok(()) => match slot.settle_registration() {
                                        Some(next) => Current::Node(next),
                                        None => {
                                            exec.current = None;
                                            drop(guard);
                                            // An interrupt requested before the slot was
                                            // visible would otherwise be missed.
                                            if slot.interruptible() && self.interrupt_pending() {
                                                let _ = Resumer::new(slot)
                                                    .resume(Arc::new(Node::DeliverInterrupt));
                                            }
                                            return SliceOutcome::Parked;
                                        }
                                    },
                                }
                            }
                            Node::Fork(source, mode) => {
                                let child =
                                    self.fork(Arc::clone(source), mode, Arc::clone(&exec.context));
                                Current::Value(erase(child))
                            }
                            Node::Yield => {
                                exec.current = Some(Current::Value(erase(())));
                                return SliceOutcome::Yielded;
                            }
                            Node::Interruptible(source, flag) => {
                                exec.stack.push(Frame::RestoreInterruptible(exec.interruptible));
                                exec.interruptible = *flag;
                                Current::Node(Arc::clone(source))
                            }
                            Node::Provide(source, derive) => {
                                match catch_defect(|| derive(&exec.context)) {
                                    Ok(context) => {
                                        let previous =
                                            std::mem::replace(&mut exec.context, Arc::new(context));
                                        exec.stack.push(Frame::RestoreContext(previous));
                                        Current::Node(Arc::clone(source))
                                    }
                                    Err(defect) => Current::Failure(Cause::Die(defect)),
                                }
                            }
                            Node::WithFiber(build) => {
                                let info = FiberInfo {
                                    fiber: Arc::clone(self),
                                    interruptible: exec.interruptible,
                                    context: Arc::clone(&exec.context),
                                };
                                guarded(|| build(&info))
                            }
                            Node::DeliverInterrupt => {
                                self.mark_interrupt_delivered();
                                Current::Failure(Cause::Interrupt(self.interruptor()))
                            }
                        }
                    }
                }
            };
        }
    }
}
