//! # Queues
//!
//! Multi-producer multi-consumer queues for fiber communication.
//!
//! ## Design
//!
//! - Bounded queues apply backpressure: `offer` on a full queue suspends
//!   the offering fiber until a `take` makes room
//! - Unbounded queues never suspend offerers
//! - `take` on an empty queue suspends until a value arrives
//! - Waiting fibers are served in arrival order; a value offered while a
//!   taker waits goes straight to that taker
//! - `shutdown` wakes every waiter: takers see `None`, offerers `false`.
//!   Values already queued can still be taken, after which `take` yields
//!   `None`
//!
//! An interrupted `take` never loses a value: if the hand-off races with
//! the interruption, the value goes to the next taker or back to the queue.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::node::{erase, unerase, Node};
use crate::effect::Effect;
use crate::fiber::Resumer;

/// Error returned by [`Queue::try_offer`]. Hands the value back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError<A> {
    /// The queue is at capacity.
    #[error("queue is full")]
    Full(A),
    /// The queue has been shut down.
    #[error("queue is shut down")]
    Shutdown(A),
}

impl<A> QueueError<A> {
    /// Recover the rejected value.
    pub fn into_inner(self) -> A {
        match self {
            QueueError::Full(value) | QueueError::Shutdown(value) => value,
        }
    }
}

struct QueueState<A> {
    items: VecDeque<A>,
    takers: VecDeque<Resumer>,
    offerers: VecDeque<(A, Resumer)>,
    shutdown: bool,
}

struct QueueInner<A> {
    id: u64,
    capacity: Option<usize>,
    state: Mutex<QueueState<A>>,
}

/// A fiber-aware FIFO queue. Cloning yields another handle to the same
/// queue.
pub struct Queue<A> {
    inner: Arc<QueueInner<A>>,
}

impl<A> Clone for Queue<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Global queue ID counter.
static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

impl<A: Send + 'static> Queue<A> {
    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
                capacity,
                state: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    takers: VecDeque::new(),
                    offerers: VecDeque::new(),
                    shutdown: false,
                }),
            }),
        }
    }

    /// A queue holding at most `capacity` values (at least one).
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    /// A queue without a size limit.
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    /// Effect that creates a bounded queue.
    pub fn make_bounded<E: Send + 'static>(capacity: usize) -> Effect<Queue<A>, E> {
        Effect::sync(move || Queue::bounded(capacity))
    }

    /// Effect that creates an unbounded queue.
    pub fn make_unbounded<E: Send + 'static>() -> Effect<Queue<A>, E> {
        Effect::sync(Queue::unbounded)
    }

    /// Get the queue ID for debugging.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The capacity, or `None` if unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.inner.capacity
    }

    /// Number of values currently queued.
    pub fn size(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    /// Returns true if no values are queued.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Returns true if a bounded queue is at capacity.
    pub fn is_full(&self) -> bool {
        let state = self.inner.state.lock();
        self.has_no_room(&state)
    }

    /// Returns true once the queue has been shut down.
    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    fn has_no_room(&self, state: &QueueState<A>) -> bool {
        self.inner
            .capacity
            .is_some_and(|capacity| state.items.len() >= capacity)
    }

    /// Hand `value` to the oldest live taker. Gives it back if none is left.
    fn hand_to_taker(state: &mut QueueState<A>, mut value: A) -> Option<A> {
        while let Some(taker) = state.takers.pop_front() {
            match taker.resume(Node::value(erase(Some(value)))) {
                Ok(()) => return None,
                Err(node) => {
                    let recovered = node
                        .take_ready_value()
                        .and_then(|value| unerase::<Option<A>>(value).ok().flatten());
                    match recovered {
                        Some(back) => value = back,
                        None => return None,
                    }
                }
            }
        }
        Some(value)
    }

    /// Move parked offerers into free slots.
    fn admit_offerers(&self, state: &mut QueueState<A>) {
        while !self.has_no_room(state) {
            match state.offerers.pop_front() {
                Some((value, offerer)) => {
                    if offerer.succeed(erase(true)) {
                        state.items.push_back(value);
                    }
                }
                None => break,
            }
        }
    }

    fn offer_now(&self, value: A, resumer: Resumer) {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            drop(state);
            resumer.succeed(erase(false));
            return;
        }
        let value = match Self::hand_to_taker(&mut state, value) {
            None => {
                drop(state);
                resumer.succeed(erase(true));
                return;
            }
            Some(value) => value,
        };
        if self.has_no_room(&state) {
            state.offerers.push_back((value, resumer));
        } else {
            state.items.push_back(value);
            drop(state);
            resumer.succeed(erase(true));
        }
    }

    fn take_now(&self, resumer: Resumer) {
        let mut state = self.inner.state.lock();
        let next = match state.items.pop_front() {
            Some(item) => Some(item),
            None => loop {
                match state.offerers.pop_front() {
                    Some((value, offerer)) => {
                        if offerer.succeed(erase(true)) {
                            break Some(value);
                        }
                    }
                    None => break None,
                }
            },
        };
        self.admit_offerers(&mut state);
        match next {
            Some(item) => {
                drop(state);
                if let Err(node) = resumer.resume(Node::value(erase(Some(item)))) {
                    self.restore(node);
                }
            }
            None if state.shutdown => {
                drop(state);
                resumer.succeed(erase(None::<A>));
            }
            None => state.takers.push_back(resumer),
        }
    }

    /// Put back a value whose taker went away.
    fn restore(&self, node: Arc<Node>) {
        let value = node
            .take_ready_value()
            .and_then(|value| unerase::<Option<A>>(value).ok().flatten());
        if let Some(value) = value {
            let mut state = self.inner.state.lock();
            if let Some(value) = Self::hand_to_taker(&mut state, value) {
                state.items.push_front(value);
            }
        }
    }

    /// Add a value without suspending.
    pub fn try_offer(&self, value: A) -> Result<(), QueueError<A>> {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return Err(QueueError::Shutdown(value));
        }
        match Self::hand_to_taker(&mut state, value) {
            None => Ok(()),
            Some(value) if self.has_no_room(&state) => Err(QueueError::Full(value)),
            Some(value) => {
                state.items.push_back(value);
                Ok(())
            }
        }
    }

    /// Remove the oldest value without suspending.
    pub fn try_take(&self) -> Option<A> {
        let mut state = self.inner.state.lock();
        let item = state.items.pop_front();
        self.admit_offerers(&mut state);
        item.or_else(|| state.items.pop_front())
    }

    /// Remove the oldest value, suspending while the queue is empty.
    /// `None` once the queue is shut down and drained.
    pub fn take<E: Send + 'static>(&self) -> Effect<Option<A>, E> {
        let queue = self.clone();
        Effect::from_ref(Node::suspended(move |resumer| queue.take_now(resumer), false))
    }

    /// Add a value, suspending while a bounded queue is full. `false` if
    /// the queue was shut down before the value was accepted.
    pub fn offer<E: Send + 'static>(&self, value: A) -> Effect<bool, E>
    where
        A: Clone + Sync,
    {
        let queue = self.clone();
        Effect::from_ref(Node::suspended(
            move |resumer| queue.offer_now(value.clone(), resumer),
            false,
        ))
    }

    /// Shut the queue down now, waking every waiting fiber.
    pub fn shutdown_now(&self) {
        let (takers, offerers) = {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            (
                std::mem::take(&mut state.takers),
                std::mem::take(&mut state.offerers),
            )
        };
        tracing::trace!(queue = self.inner.id, "queue shut down");
        for taker in takers {
            taker.succeed(erase(None::<A>));
        }
        for (_, offerer) in offerers {
            offerer.succeed(erase(false));
        }
    }

    /// Effect that shuts the queue down.
    pub fn shutdown<E: Send + 'static>(&self) -> Effect<(), E> {
        let queue = self.clone();
        Effect::sync(move || queue.shutdown_now())
    }
}

impl<A> fmt::Debug for Queue<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Queue")
            .field("id", &self.inner.id)
            .field("capacity", &self.inner.capacity)
            .field("size", &state.items.len())
            .field("takers", &state.takers.len())
            .field("offerers", &state.offerers.len())
            .field("shutdown", &state.shutdown)
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
    use std::time::Duration;

    type Eff<A> = Effect<A, String>;

    fn runtime() -> Runtime {
        Runtime::new(
            RuntimeConfig::builder()
                .num_workers(2)
                .thread_name_prefix("queue-test")
                .build()
                .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_queue_creation() {
        let q: Queue<i32> = Queue::bounded(2);
        assert_eq!(q.capacity(), Some(2));
        assert!(q.is_empty());
        assert_eq!(Queue::<i32>::bounded(0).capacity(), Some(1));
        assert_eq!(Queue::<i32>::unbounded().capacity(), None);
    }

    #[test]
    fn test_try_offer_and_take() {
        let q = Queue::bounded(2);
        q.try_offer(1).unwrap();
        q.try_offer(2).unwrap();
        assert!(q.is_full());
        assert_eq!(q.try_offer(3), Err(QueueError::Full(3)));
        assert_eq!(q.try_take(), Some(1));
        assert_eq!(q.try_take(), Some(2));
        assert_eq!(q.try_take(), None);
    }

    #[test]
    fn test_queue_error_display() {
        assert_eq!(QueueError::Full(1).to_string(), "queue is full");
        assert_eq!(QueueError::Shutdown(1).into_inner(), 1);
    }

    #[test]
    fn test_offer_take_in_order() {
        let rt = runtime();
        let q = Queue::unbounded();
        let program = q
            .offer::<String>(1)
            .zip_right(q.offer(2))
            .zip_right(q.take())
            .zip(q.take());
        assert_eq!(rt.run_sync(program), Ok((Some(1), Some(2))));
    }

    #[test]
    fn test_take_waits_for_offer() {
        let rt = runtime();
        let q = Queue::<i32>::unbounded();
        let producer = q.offer::<String>(42).delay(Duration::from_millis(10));
        let program = q.take::<String>().zip_par(producer);
        assert_eq!(rt.run_blocking(program), Ok((Some(42), true)));
    }

    #[test]
    fn test_bounded_offer_suspends_until_take() {
        let rt = runtime();
        let q = Queue::bounded(1);
        q.try_offer(1).unwrap();
        let blocked = rt.run_async(q.offer::<String>(2));
        std::thread::sleep(Duration::from_millis(10));
        assert!(!blocked.is_done());
        assert_eq!(q.try_take(), Some(1));
        assert_eq!(blocked.wait(), Ok(true));
        assert_eq!(q.try_take(), Some(2));
    }

    #[test]
    fn test_shutdown_wakes_waiters_and_drains() {
        let rt = runtime();
        let q = Queue::<i32>::unbounded();
        let waiting = rt.run_async(q.take::<String>());
        std::thread::sleep(Duration::from_millis(10));
        q.shutdown_now();
        assert_eq!(waiting.wait(), Ok(None));

        let q = Queue::bounded(1);
        q.try_offer(7).unwrap();
        q.shutdown_now();
        assert_eq!(q.try_offer(8), Err(QueueError::Shutdown(8)));
        assert_eq!(rt.run_sync(q.take::<String>()), Ok(Some(7)));
        assert_eq!(rt.run_sync(q.take::<String>()), Ok(None));
        assert_eq!(rt.run_sync(q.offer::<String>(9)), Ok(false));
    }

    #[test]
    fn test_interrupted_taker_loses_nothing() {
        let rt = runtime();
        let q = Queue::<i32>::unbounded();
        let taker = rt.run_async(q.take::<String>());
        std::thread::sleep(Duration::from_millis(10));
        taker.interrupt();
        assert!(taker.wait().unwrap_err().is_interrupted());
        q.try_offer(5).unwrap();
        assert_eq!(q.try_take(), Some(5));
    }

    #[test]
    fn test_many_producers_one_consumer() {
        let rt = runtime();
        let q = Queue::bounded(4);
        let producers: Vec<Eff<bool>> = (0..50).map(|i| q.offer(i)).collect();
        let consumer = Effect::all((0..50).map(|_| q.take::<String>()), Concurrency::Sequential);
        let (mut taken, offered) = rt
            .run_blocking(consumer.zip_par(Effect::all(producers, Concurrency::Unbounded)))
            .unwrap();
        assert!(offered.into_iter().all(|ok| ok));
        taken.sort();
        assert_eq!(taken, (0..50).map(Some).collect::<Vec<_>>());
    }
}
