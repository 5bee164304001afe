//! # Synchronization Primitives
//!
//! Fiber-aware synchronization. Waiting never blocks a worker thread: a
//! fiber that cannot proceed parks on an async boundary and is resumed by
//! whoever releases the resource.
//!
//! ## Primitives
//!
//! - [`Semaphore`] - Counting semaphore with FIFO waiters
//!
//! ## Design Notes
//!
//! Waiters are served strictly in arrival order: a large request at the
//! head of the queue holds back smaller requests behind it. A waiter that
//! is interrupted while queued leaves the queue as the interruption is
//! delivered; if it was granted permits at the same moment, the permits go
//! back to the pool.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::{Cause, Defect};
use crate::effect::node::{erase, Cont, Node, NodeRef, Value};
use crate::effect::{ensuring_node, Effect};
use crate::fiber::{FiberInfo, Resumer};

// ============================================================================
// Semaphore
// ============================================================================

struct Waiter {
    permits: usize,
    resumer: Resumer,
}

struct SemaphoreState {
    available: usize,
    waiters: VecDeque<Waiter>,
}

impl SemaphoreState {
    /// Grant permits to waiters at the head of the queue while they fit.
    fn dispatch(&mut self) -> Vec<Waiter> {
        let mut granted = Vec::new();
        loop {
            match self.waiters.front() {
                Some(waiter) if waiter.resumer.is_settled() => {
                    self.waiters.pop_front();
                }
                Some(waiter) if waiter.permits <= self.available => {
                    if let Some(waiter) = self.waiters.pop_front() {
                        self.available -= waiter.permits;
                        granted.push(waiter);
                    }
                }
                _ => break,
            }
        }
        granted
    }
}

struct SemaphoreInner {
    /// Unique semaphore ID for debugging.
    id: u64,
    capacity: usize,
    state: Mutex<SemaphoreState>,
}

/// A counting semaphore for fibers.
///
/// Cloning yields another handle to the same permits.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<SemaphoreInner>,
}

impl Semaphore {
    /// Creates a semaphore with `permits` permits, all available.
    pub fn new(permits: usize) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            inner: Arc::new(SemaphoreInner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                capacity: permits,
                state: Mutex::new(SemaphoreState {
                    available: permits,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Effect that creates a semaphore.
    pub fn make<E: Send + 'static>(permits: usize) -> Effect<Semaphore, E> {
        Effect::sync(move || Semaphore::new(permits))
    }

    /// Get the semaphore ID for debugging.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Get the current number of available permits.
    pub fn available_permits(&self) -> usize {
        self.inner.state.lock().available
    }

    /// Get the maximum number of permits.
    pub fn max_permits(&self) -> usize {
        self.inner.capacity
    }

    /// Number of fibers queued for permits.
    pub fn waiting(&self) -> usize {
        let state = self.inner.state.lock();
        state
            .waiters
            .iter()
            .filter(|waiter| !waiter.resumer.is_settled())
            .count()
    }

    /// Take `permits` permits now if nobody is queued and enough are free.
    pub fn try_acquire(&self, permits: usize) -> bool {
        let mut state = self.inner.state.lock();
        if state.waiters.is_empty() && state.available >= permits {
            state.available -= permits;
            true
        } else {
            false
        }
    }

    /// Wait for one permit.
    pub fn acquire<E: Send + 'static>(&self) -> Effect<(), E> {
        self.acquire_n(1)
    }

    /// Wait for `permits` permits. Asking for more than the semaphore's
    /// capacity is a defect.
    ///
    /// Prefer [`with_permits`](Self::with_permits), which cannot leak
    /// permits when the holder fails or is interrupted.
    pub fn acquire_n<E: Send + 'static>(&self, permits: usize) -> Effect<(), E> {
        Effect::from_ref(self.acquire_node(permits))
    }

    /// Return one permit.
    pub fn release<E: Send + 'static>(&self) -> Effect<(), E> {
        self.release_n(1)
    }

    /// Return `permits` permits, waking queued fibers that now fit.
    pub fn release_n<E: Send + 'static>(&self, permits: usize) -> Effect<(), E> {
        let semaphore = self.clone();
        Effect::sync(move || semaphore.release_now(permits))
    }

    /// Run `effect` holding one permit.
    pub fn with_permit<A, E>(&self, effect: Effect<A, E>) -> Effect<A, E>
    where
        A: Send + 'static,
        E: Send + 'static,
    {
        self.with_permits(1, effect)
    }

    /// Run `effect` holding `permits` permits. The permits are returned
    /// however `effect` ends, including interruption.
    pub fn with_permits<A, E>(&self, permits: usize, effect: Effect<A, E>) -> Effect<A, E>
    where
        A: Send + 'static,
        E: Send + 'static,
    {
        Effect::from_ref(self.with_permits_node(permits, effect.node()))
    }

    pub(crate) fn acquire_node(&self, permits: usize) -> NodeRef {
        let inner = Arc::clone(&self.inner);
        let wait = Node::suspended(
            move |resumer| {
                if permits > inner.capacity {
                    let _ = resumer.resume(Node::die(Defect::new(format!(
                        "requested {} permits from a semaphore of {}",
                        permits, inner.capacity
                    ))));
                    return;
                }
                let granted = {
                    let mut state = inner.state.lock();
                    state.waiters.push_back(Waiter { permits, resumer });
                    state.dispatch()
                };
                Self::resume_granted(&inner, granted);
            },
            // Waiting for a permit stays interruptible inside masked regions.
            true,
        );
        let owner = Arc::clone(&self.inner);
        Arc::new(Node::Fold {
            source: wait,
            on_failure: Cont::shared(move |cause: Cause<Value>| {
                let owner = Arc::clone(&owner);
                let unqueue = Arc::new(Node::Sync(Arc::new(move || {
                    // Lock order: semaphore, then slot.
                    owner
                        .state
                        .lock()
                        .waiters
                        .retain(|waiter| !waiter.resumer.is_settled());
                    Ok(erase(()))
                })));
                Node::then_once(unqueue, move |_| Node::fail_cause(cause))
            }),
            on_success: Cont::shared(Node::value),
            finalizer: true,
        })
    }

    pub(crate) fn with_permits_node(&self, permits: usize, node: NodeRef) -> NodeRef {
        let semaphore = self.clone();
        Arc::new(Node::WithFiber(Arc::new(move |info: &FiberInfo| {
            let releaser = semaphore.clone();
            let release = Arc::new(Node::Sync(Arc::new(move || {
                releaser.release_now(permits);
                Ok(erase(()))
            })));
            let body = ensuring_node(
                Arc::new(Node::Interruptible(Arc::clone(&node), info.interruptible)),
                release,
            );
            Node::uninterruptible(Node::then_once(
                semaphore.acquire_node(permits),
                move |_| body,
            ))
        })))
    }

    pub(crate) fn release_now(&self, permits: usize) {
        let inner = &self.inner;
        let granted = {
            let mut state = inner.state.lock();
            state.available = (state.available + permits).min(inner.capacity);
            state.dispatch()
        };
        Self::resume_granted(inner, granted);
    }

    /// Resume granted waiters outside the lock. Permits granted to a waiter
    /// that was interrupted in the meantime are handed on.
    fn resume_granted(inner: &SemaphoreInner, mut granted: Vec<Waiter>) {
        while !granted.is_empty() {
            let mut refund = 0;
            for waiter in granted {
                if waiter.resumer.resume(Node::unit()).is_err() {
                    refund += waiter.permits;
                }
            }
            if refund == 0 {
                return;
            }
            let mut state = inner.state.lock();
            state.available = (state.available + refund).min(inner.capacity);
            granted = state.dispatch();
        }
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Semaphore")
            .field("id", &self.inner.id)
            .field("available", &state.available)
            .field("max_permits", &self.inner.capacity)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::effect::Concurrency;
    use crate::runtime::Runtime;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    type Eff<A> = Effect<A, String>;

    fn runtime() -> Runtime {
        Runtime::new(
            RuntimeConfig::builder()
                .num_workers(4)
                .thread_name_prefix("sync-test")
                .build()
                .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_semaphore_creation() {
        let sem = Semaphore::new(3);
        assert_eq!(sem.available_permits(), 3);
        assert_eq!(sem.max_permits(), 3);
        assert_eq!(sem.waiting(), 0);
    }

    #[test]
    fn test_try_acquire_and_release() {
        let sem = Semaphore::new(2);
        assert!(sem.try_acquire(2));
        assert!(!sem.try_acquire(1));
        sem.release_now(1);
        assert_eq!(sem.available_permits(), 1);
        sem.release_now(5);
        assert_eq!(sem.available_permits(), 2);
    }

    #[test]
    fn test_with_permit_releases_on_failure() {
        let rt = runtime();
        let sem = Semaphore::new(1);
        let guarded = sem.with_permit(Eff::<i32>::fail("inside".to_string()));
        assert!(rt.run_sync(guarded).is_err());
        assert_eq!(sem.available_permits(), 1);

        let guarded = sem.with_permit(Eff::<i32>::die("boom"));
        assert!(rt.run_sync(guarded).unwrap_err().is_defect());
        assert_eq!(sem.available_permits(), 1);
    }

    #[test]
    fn test_acquire_more_than_capacity_is_defect() {
        let rt = runtime();
        let sem = Semaphore::new(1);
        assert!(rt.run_sync(sem.acquire_n::<String>(2)).unwrap_err().is_defect());
    }

    #[test]
    fn test_with_permit_serializes() {
        let rt = runtime();
        let sem = Semaphore::new(1);
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<Eff<()>> = (0..8)
            .map(|_| {
                let enter = Arc::clone(&inside);
                let leave = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                let body = Eff::sync(move || {
                    let now = enter.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                })
                .zip_right(Eff::sleep(Duration::from_millis(2)))
                .zip_right(Eff::sync(move || {
                    leave.fetch_sub(1, Ordering::SeqCst);
                }));
                sem.with_permit(body)
            })
            .collect();

        rt.run_blocking(Effect::all(tasks, Concurrency::Unbounded)).unwrap();
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(sem.available_permits(), 1);
    }

    #[test]
    fn test_interrupted_waiter_does_not_leak_permits() {
        let rt = runtime();
        let sem = Semaphore::new(1);
        assert!(sem.try_acquire(1));

        let waiter = rt.run_async(sem.with_permit(Eff::succeed(1)));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(sem.waiting(), 1);
        waiter.interrupt();
        assert!(waiter.wait().unwrap_err().is_interrupted());

        sem.release_now(1);
        assert_eq!(sem.available_permits(), 1);
        assert!(sem.try_acquire(1));
    }

    #[test]
    fn test_interrupted_waiters_leave_the_queue() {
        let rt = runtime();
        let sem = Semaphore::new(1);
        assert!(sem.try_acquire(1));

        let waiters: Vec<_> = (0..5)
            .map(|_| rt.run_async(sem.with_permit(Eff::succeed(1))))
            .collect();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(sem.inner.state.lock().waiters.len(), 5);

        for waiter in waiters {
            waiter.interrupt();
            assert!(waiter.wait().unwrap_err().is_interrupted());
        }
        // The permit is still held, yet nothing stale remains queued.
        assert_eq!(sem.inner.state.lock().waiters.len(), 0);
        assert_eq!(sem.available_permits(), 0);

        sem.release_now(1);
        assert!(sem.try_acquire(1));
    }

    #[test]
    fn test_release_wakes_fifo() {
        let rt = runtime();
        let sem = Semaphore::new(1);
        assert!(sem.try_acquire(1));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..3)
            .map(|i| {
                let order = Arc::clone(&order);
                let handle = rt.run_async(sem.with_permit(Eff::sync(move || order.lock().push(i))));
                std::thread::sleep(Duration::from_millis(10));
                handle
            })
            .collect();

        sem.release_now(1);
        for handle in handles {
            handle.wait().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}
