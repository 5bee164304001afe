//! Concurrent combinators: `all`, `race` and friends.
//!
//! Every concurrent combinator forks its operands as children of the
//! running fiber inside a masked region, waits (interruptibly, if the caller
//! was) for the group to settle, then interrupts and awaits whatever is
//! still running before it returns. No operand outlives the combinator.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::cause::{Cause, Defect};
use crate::fiber::{interrupt_and_await, FiberId, FiberInfo, FiberRef, Resumer};
use crate::sync::Semaphore;

use super::node::{erase, unerase, Cont, ErasedExit, ForkMode, Node, NodeRef, Value};
use super::Effect;

/// How many operands of `all`-style combinators run at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Concurrency {
    /// One after another, left to right.
    #[default]
    Sequential,
    /// All at once.
    Unbounded,
    /// At most `n` at once. `Bounded(0)` behaves like `Bounded(1)`.
    Bounded(usize),
}

// ============================================================================
// Group plumbing
// ============================================================================

/// Suspend until a group settles. `settle` hands the resumer back when the
/// group has already settled and keeps it otherwise.
fn wait_until<F>(settle: F) -> NodeRef
where
    F: Fn(Resumer) -> Option<Resumer> + Send + Sync + 'static,
{
    Node::suspended(
        move |resumer| {
            if let Some(resumer) = settle(resumer) {
                let _ = resumer.resume(Node::unit());
            }
        },
        false,
    )
}

/// Fork a child whose outcome, including interruption, is fed to `record`.
fn fork_recording<F>(info: &FiberInfo, source: NodeRef, record: F) -> FiberRef
where
    F: Fn(ErasedExit) + Send + Sync + 'static,
{
    let record = Arc::new(record);
    let on_failure = Arc::clone(&record);
    let root = Arc::new(Node::Fold {
        source,
        on_failure: Cont::shared(move |cause: Cause<Value>| {
            on_failure(Err(cause));
            Node::unit()
        }),
        on_success: Cont::shared(move |value: Value| {
            record(Ok(value));
            Node::unit()
        }),
        finalizer: true,
    });
    info.fork(root, ForkMode::Child)
}

/// Interrupt and await the group, then end with `exit`.
fn settle_group(fibers: Vec<FiberRef>, me: FiberId, exit: ErasedExit) -> NodeRef {
    Node::then_once(interrupt_and_await(fibers, me), move |_| Node::from_exit(exit))
}

/// Run `spawn` masked. It also receives the caller's interruptibility so
/// the wait for the group can restore it.
fn supervise<S>(spawn: S) -> NodeRef
where
    S: Fn(&FiberInfo, bool) -> NodeRef + Send + Sync + 'static,
{
    let spawn = Arc::new(spawn);
    Arc::new(Node::WithFiber(Arc::new(move |outer: &FiberInfo| {
        let restore = outer.interruptible;
        let spawn = Arc::clone(&spawn);
        Node::uninterruptible(Arc::new(Node::WithFiber(Arc::new(
            move |info: &FiberInfo| spawn(info, restore),
        ))))
    })))
}

// ============================================================================
// Gather
// ============================================================================

struct GatherState {
    slots: Vec<Option<Value>>,
    remaining: usize,
    failure: Option<Cause<Value>>,
    settled: bool,
    waiter: Option<Resumer>,
}

struct Gather {
    state: Mutex<GatherState>,
}

impl Gather {
    fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GatherState {
                slots: (0..size).map(|_| None).collect(),
                remaining: size,
                failure: None,
                settled: false,
                waiter: None,
            }),
        })
    }

    fn deposit(&self, index: usize, exit: ErasedExit) {
        let waiter = {
            let mut state = self.state.lock();
            if state.settled {
                return;
            }
            match exit {
                Ok(value) => {
                    state.slots[index] = Some(value);
                    state.remaining -= 1;
                    if state.remaining > 0 {
                        return;
                    }
                }
                Err(cause) => state.failure = Some(cause),
            }
            state.settled = true;
            state.waiter.take()
        };
        if let Some(waiter) = waiter {
            let _ = waiter.resume(Node::unit());
        }
    }

    fn park(&self, resumer: Resumer) -> Option<Resumer> {
        let mut state = self.state.lock();
        if state.settled {
            Some(resumer)
        } else {
            state.waiter = Some(resumer);
            None
        }
    }

    fn outcome(&self) -> ErasedExit {
        let mut state = self.state.lock();
        if let Some(cause) = state.failure.take() {
            return Err(cause);
        }
        std::mem::take(&mut state.slots)
            .into_iter()
            .collect::<Option<Vec<Value>>>()
            .map(erase)
            .ok_or_else(|| Cause::Die(Defect::new("gather settled with missing results")))
    }
}

fn sequence(children: Arc<Vec<NodeRef>>, index: usize, mut acc: Vec<Value>) -> NodeRef {
    match children.get(index) {
        None => Node::value(erase(acc)),
        Some(child) => Node::then_once(Arc::clone(child), move |value| {
            acc.push(value);
            sequence(children, index + 1, acc)
        }),
    }
}

/// Run `children` and produce a `Vec<Value>` in input order.
pub(crate) fn gather_node(children: Vec<NodeRef>, concurrency: Concurrency) -> NodeRef {
    let children = Arc::new(children);
    let limit = match concurrency {
        Concurrency::Sequential => {
            return Arc::new(Node::Suspend(Arc::new(move || {
                sequence(Arc::clone(&children), 0, Vec::with_capacity(children.len()))
            })));
        }
        _ if children.is_empty() => {
            return Arc::new(Node::Suspend(Arc::new(|| Node::value(erase(Vec::<Value>::new())))));
        }
        Concurrency::Unbounded => None,
        Concurrency::Bounded(n) => Some(n.max(1)),
    };

    supervise(move |info, restore| {
        let gather = Gather::new(children.len());
        let semaphore = limit.map(Semaphore::new);
        let fibers: Vec<FiberRef> = children
            .iter()
            .enumerate()
            .map(|(index, child)| {
                let source = match &semaphore {
                    Some(semaphore) => semaphore.with_permits_node(1, Arc::clone(child)),
                    None => Arc::clone(child),
                };
                let gather = Arc::clone(&gather);
                fork_recording(info, source, move |exit| gather.deposit(index, exit))
            })
            .collect();
        let me = info.id();

        let parked = Arc::clone(&gather);
        let wait = wait_until(move |resumer| parked.park(resumer));
        let on_failure = fibers.clone();
        Arc::new(Node::Fold {
            source: Arc::new(Node::Interruptible(wait, restore)),
            on_failure: Cont::once(move |cause: Cause<Value>| {
                settle_group(on_failure, me, Err(cause))
            }),
            on_success: Cont::once(move |_: Value| settle_group(fibers, me, gather.outcome())),
            finalizer: true,
        })
    })
}

// ============================================================================
// Race
// ============================================================================

struct RaceState {
    winner: Option<ErasedExit>,
    first_failure: Option<ErasedExit>,
    failures: usize,
    settled: bool,
    waiter: Option<Resumer>,
}

struct Race {
    first_exit: bool,
    state: Mutex<RaceState>,
}

impl Race {
    fn new(first_exit: bool) -> Arc<Self> {
        Arc::new(Self {
            first_exit,
            state: Mutex::new(RaceState {
                winner: None,
                first_failure: None,
                failures: 0,
                settled: false,
                waiter: None,
            }),
        })
    }

    fn record(&self, exit: ErasedExit) {
        let waiter = {
            let mut state = self.state.lock();
            if state.settled {
                return;
            }
            if self.first_exit || exit.is_ok() {
                state.winner = Some(exit);
            } else {
                state.failures += 1;
                if state.first_failure.is_none() {
                    state.first_failure = Some(exit);
                }
                if state.failures < 2 {
                    return;
                }
                state.winner = state.first_failure.take();
            }
            state.settled = true;
            state.waiter.take()
        };
        if let Some(waiter) = waiter {
            let _ = waiter.resume(Node::unit());
        }
    }

    fn park(&self, resumer: Resumer) -> Option<Resumer> {
        let mut state = self.state.lock();
        if state.settled {
            Some(resumer)
        } else {
            state.waiter = Some(resumer);
            None
        }
    }

    fn outcome(&self) -> ErasedExit {
        self.state
            .lock()
            .winner
            .take()
            .unwrap_or_else(|| Err(Cause::Die(Defect::new("race settled without a winner"))))
    }
}

fn race_node(left: NodeRef, right: NodeRef, first_exit: bool) -> NodeRef {
    supervise(move |info, restore| {
        let race = Race::new(first_exit);
        let fibers: Vec<FiberRef> = [&left, &right]
            .into_iter()
            .map(|source| {
                let race = Arc::clone(&race);
                fork_recording(info, Arc::clone(source), move |exit| race.record(exit))
            })
            .collect();
        let me = info.id();

        let parked = Arc::clone(&race);
        let wait = wait_until(move |resumer| parked.park(resumer));
        let on_failure = fibers.clone();
        Arc::new(Node::Fold {
            source: Arc::new(Node::Interruptible(wait, restore)),
            on_failure: Cont::once(move |cause: Cause<Value>| {
                settle_group(on_failure, me, Err(cause))
            }),
            on_success: Cont::once(move |_: Value| settle_group(fibers, me, race.outcome())),
            finalizer: true,
        })
    })
}

// ============================================================================
// Typed API
// ============================================================================

fn unerase_all<A: 'static>(values: Vec<Value>) -> Result<Vec<A>, Defect> {
    values.into_iter().map(unerase::<A>).collect()
}

impl<A, E> Effect<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    /// Run every effect and collect the values in input order.
    ///
    /// The first failure wins: the remaining operands are interrupted and
    /// awaited before the failure is returned.
    pub fn all<I>(effects: I, concurrency: Concurrency) -> Effect<Vec<A>, E>
    where
        I: IntoIterator<Item = Effect<A, E>>,
    {
        let nodes = effects.into_iter().map(|effect| effect.node).collect();
        Effect::<Vec<Value>, E>::from_ref(gather_node(nodes, concurrency)).flat_map(
            |values| match unerase_all::<A>(values) {
                Ok(values) => Effect::ready(values),
                Err(defect) => Effect::ready_cause(Cause::Die(defect)),
            },
        )
    }

    /// [`all`](Self::all) over keyed effects, collected into a map.
    pub fn all_keyed<K, I>(effects: I, concurrency: Concurrency) -> Effect<BTreeMap<K, A>, E>
    where
        K: Ord + Clone + Send + Sync + 'static,
        I: IntoIterator<Item = (K, Effect<A, E>)>,
    {
        let (keys, nodes): (Vec<K>, Vec<NodeRef>) = effects
            .into_iter()
            .map(|(key, effect)| (key, effect.node))
            .unzip();
        Effect::<Vec<Value>, E>::from_ref(gather_node(nodes, concurrency)).flat_map(
            move |values| match unerase_all::<A>(values) {
                Ok(values) => Effect::ready(keys.iter().cloned().zip(values).collect()),
                Err(defect) => Effect::ready_cause(Cause::Die(defect)),
            },
        )
    }

    /// Apply `f` to every item and run the resulting effects with
    /// [`all`](Self::all).
    pub fn for_each<T, I, F>(items: I, f: F, concurrency: Concurrency) -> Effect<Vec<A>, E>
    where
        I: IntoIterator<Item = T>,
        F: Fn(T) -> Effect<A, E>,
    {
        Self::all(items.into_iter().map(f), concurrency)
    }

    /// Run both effects concurrently and pair their values.
    pub fn zip_par<B: Send + 'static>(self, that: Effect<B, E>) -> Effect<(A, B), E> {
        let nodes = vec![self.node, that.node];
        Effect::<Vec<Value>, E>::from_ref(gather_node(nodes, Concurrency::Unbounded)).flat_map(
            |values| {
                let mut values = values.into_iter();
                match (values.next(), values.next()) {
                    (Some(a), Some(b)) => match (unerase::<A>(a), unerase::<B>(b)) {
                        (Ok(a), Ok(b)) => Effect::ready((a, b)),
                        (Err(defect), _) | (_, Err(defect)) => {
                            Effect::ready_cause(Cause::Die(defect))
                        }
                    },
                    _ => Effect::ready_cause(Cause::Die(Defect::new("zip_par lost an operand"))),
                }
            },
        )
    }

    /// Run both effects concurrently; the first to succeed wins and the
    /// other is interrupted. If both fail, the first failure is returned.
    pub fn race(self, that: Effect<A, E>) -> Self {
        Self::from_ref(race_node(self.node, that.node, false))
    }

    /// Run both effects concurrently; the first to finish, successfully or
    /// not, wins and the other is interrupted.
    pub fn race_first(self, that: Effect<A, E>) -> Self {
        Self::from_ref(race_node(self.node, that.node, true))
    }

    /// `None` if this effect does not finish within `duration`; the effect
    /// is then interrupted.
    pub fn timeout(self, duration: Duration) -> Effect<Option<A>, E> {
        self.map(Some)
            .race_first(Effect::<(), E>::sleep(duration).map(|_| None))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::{RunError, Runtime};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Eff<A> = Effect<A, String>;

    fn runtime() -> Runtime {
        Runtime::new(
            RuntimeConfig::builder()
                .num_workers(4)
                .thread_name_prefix("concurrent-test")
                .build()
                .unwrap(),
        )
        .unwrap()
    }

    fn delayed(value: i32, millis: u64) -> Eff<i32> {
        Eff::succeed(value).delay(Duration::from_millis(millis))
    }

    #[test]
    fn test_all_sequential_order() {
        let rt = runtime();
        let log = Arc::new(Mutex::new(Vec::new()));
        let effects: Vec<Eff<usize>> = (0..5)
            .map(|i| {
                let log = Arc::clone(&log);
                Eff::sync(move || {
                    log.lock().push(i);
                    i * 10
                })
            })
            .collect();
        let result = rt.run_sync(Effect::all(effects, Concurrency::Sequential));
        assert_eq!(result, Ok(vec![0, 10, 20, 30, 40]));
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_all_unbounded_keeps_input_order() {
        let rt = runtime();
        let effects = vec![delayed(1, 30), delayed(2, 5), delayed(3, 15)];
        let result = rt.run_blocking(Effect::all(effects, Concurrency::Unbounded));
        assert_eq!(result, Ok(vec![1, 2, 3]));
    }

    #[test]
    fn test_all_empty() {
        let rt = runtime();
        let none: Vec<Eff<i32>> = Vec::new();
        assert_eq!(rt.run_sync(Effect::all(none.clone(), Concurrency::Sequential)), Ok(vec![]));
        assert_eq!(rt.run_sync(Effect::all(none, Concurrency::Unbounded)), Ok(vec![]));
    }

    #[test]
    fn test_all_fails_fast_and_interrupts_siblings() {
        let rt = runtime();
        let finalized = Arc::new(AtomicUsize::new(0));
        let sibling = |finalized: &Arc<AtomicUsize>| {
            let finalized = Arc::clone(finalized);
            Eff::<i32>::never().ensuring(Effect::<(), Infallible>::sync(move || {
                finalized.fetch_add(1, Ordering::SeqCst);
            }))
        };
        let effects = vec![
            sibling(&finalized),
            Eff::fail("broken".to_string()).delay(Duration::from_millis(10)),
            sibling(&finalized),
        ];
        let result = rt.run_blocking(Effect::all(effects, Concurrency::Unbounded));
        assert_eq!(result, Err(RunError::Failure("broken".into())));
        assert_eq!(finalized.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_all_bounded_limits_in_flight() {
        let rt = runtime();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let effects: Vec<Eff<()>> = (0..10)
            .map(|_| {
                let (enter, leave, peak) =
                    (Arc::clone(&running), Arc::clone(&running), Arc::clone(&peak));
                Eff::sync(move || {
                    let now = enter.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                })
                .zip_right(Eff::sleep(Duration::from_millis(3)))
                .zip_right(Eff::sync(move || {
                    leave.fetch_sub(1, Ordering::SeqCst);
                }))
            })
            .collect();
        let result = rt.run_blocking(Effect::all(effects, Concurrency::Bounded(3)));
        assert_eq!(result.map(|v| v.len()), Ok(10));
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_all_keyed() {
        let rt = runtime();
        let effects = vec![("b", delayed(2, 5)), ("a", delayed(1, 1))];
        let result = rt.run_blocking(Effect::all_keyed(effects, Concurrency::Unbounded)).unwrap();
        assert_eq!(result.get("a"), Some(&1));
        assert_eq!(result.get("b"), Some(&2));
    }

    #[test]
    fn test_for_each() {
        let rt = runtime();
        let effect = Effect::for_each(1..=4, |x: i32| Eff::succeed(x * x), Concurrency::Bounded(2));
        assert_eq!(rt.run_blocking(effect), Ok(vec![1, 4, 9, 16]));
    }

    #[test]
    fn test_zip_par_runs_concurrently() {
        let rt = runtime();
        let start = std::time::Instant::now();
        let effect = delayed(1, 40).zip_par(Eff::succeed("x").delay(Duration::from_millis(40)));
        assert_eq!(rt.run_blocking(effect), Ok((1, "x")));
        assert!(start.elapsed() < Duration::from_millis(75));
    }

    #[test]
    fn test_race_first_success_wins() {
        let rt = runtime();
        assert_eq!(rt.run_blocking(delayed(1, 40).race(delayed(2, 5))), Ok(2));

        let failing = Eff::<i32>::fail("fast failure".to_string());
        assert_eq!(rt.run_blocking(failing.race(delayed(3, 10))), Ok(3));
    }

    #[test]
    fn test_race_both_fail() {
        let rt = runtime();
        let first = Eff::<i32>::fail("first".to_string());
        let second = Eff::<i32>::fail("second".to_string()).delay(Duration::from_millis(10));
        assert_eq!(rt.run_blocking(first.race(second)), Err(RunError::Failure("first".into())));
    }

    #[test]
    fn test_race_first_takes_failure() {
        let rt = runtime();
        let failing = Eff::<i32>::fail("fast failure".to_string());
        assert_eq!(
            rt.run_blocking(failing.race_first(delayed(3, 20))),
            Err(RunError::Failure("fast failure".into()))
        );
    }

    #[test]
    fn test_race_interrupts_loser() {
        let rt = runtime();
        let finalized = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&finalized);
        let loser = Eff::<i32>::never().ensuring(Effect::<(), Infallible>::sync(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(rt.run_blocking(loser.race(delayed(7, 5))), Ok(7));
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timeout() {
        let rt = runtime();
        assert_eq!(rt.run_blocking(delayed(1, 5).timeout(Duration::from_millis(200))), Ok(Some(1)));
        assert_eq!(rt.run_blocking(Eff::<i32>::never().timeout(Duration::from_millis(10))), Ok(None));
    }

    #[test]
    fn test_finished_timeouts_release_their_fibers() {
        #[derive(Clone)]
        struct Payload(Arc<Vec<u8>>);

        let rt = runtime();
        let payload = Arc::new(vec![0u8; 1024]);
        for _ in 0..100 {
            let effect = Eff::succeed(1)
                .timeout(Duration::from_secs(3600))
                .provide_service(Payload(Arc::clone(&payload)));
            assert_eq!(rt.run_blocking(effect), Ok(Some(1)));
        }
        // Losing sleepers may still be unwinding on a worker.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while Arc::strong_count(&payload) > 1 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    fn test_interrupting_all_interrupts_children() {
        let rt = runtime();
        let finalized = Arc::new(AtomicUsize::new(0));
        let effects: Vec<Eff<i32>> = (0..3)
            .map(|_| {
                let f = Arc::clone(&finalized);
                Eff::never().ensuring(Effect::<(), Infallible>::sync(move || {
                    f.fetch_add(1, Ordering::SeqCst);
                }))
            })
            .collect();
        let handle = rt.run_async(Effect::all(effects, Concurrency::Unbounded));
        std::thread::sleep(Duration::from_millis(20));
        handle.interrupt();
        assert!(handle.wait().unwrap_err().is_interrupted());
        assert_eq!(finalized.load(Ordering::SeqCst), 3);
    }
}
