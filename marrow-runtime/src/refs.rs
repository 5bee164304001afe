//! # Shared References
//!
//! [`Ref`] is a mutable cell shared between fibers. Every operation is an
//! effect that performs exactly one atomic step on the cell, so concurrent
//! `update`s never lose writes.
//!
//! [`SynchronizedRef`] adds updates whose new value is computed by an
//! effect. Those run one at a time: an update holds the ref's one-permit
//! [`Semaphore`] from read to write, and queued updates proceed in FIFO
//! order. The permit is returned however the update ends.
//!
//! ## Example
//!
//! ```rust,ignore
//! use marrow_runtime::{Effect, Ref};
//!
//! let program = Ref::<i32>::make::<()>(0).flat_map(|counter| {
//!     counter
//!         .update(|n| n + 1)
//!         .zip_right(counter.update_and_get(|n| n * 10))
//! });
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::Effect;
use crate::sync::Semaphore;

// ============================================================================
// Ref
// ============================================================================

/// A mutable cell shared by reference.
pub struct Ref<A> {
    value: Arc<Mutex<A>>,
}

impl<A> Clone for Ref<A> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
        }
    }
}

impl<A> Ref<A>
where
    A: Clone + Send + Sync + 'static,
{
    /// Create a cell outside of any effect.
    pub fn new(initial: A) -> Self {
        Self {
            value: Arc::new(Mutex::new(initial)),
        }
    }

    /// Effect that allocates a fresh cell each time it runs.
    pub fn make<E: Send + 'static>(initial: A) -> Effect<Ref<A>, E> {
        Effect::sync(move || Ref::new(initial.clone()))
    }

    /// Read the current value.
    pub fn get<E: Send + 'static>(&self) -> Effect<A, E> {
        let cell = self.clone();
        Effect::sync(move || cell.value.lock().clone())
    }

    /// Replace the value.
    pub fn set<E: Send + 'static>(&self, value: A) -> Effect<(), E> {
        let cell = self.clone();
        Effect::sync(move || *cell.value.lock() = value.clone())
    }

    /// Apply `f` to the value.
    pub fn update<E, F>(&self, f: F) -> Effect<(), E>
    where
        E: Send + 'static,
        F: Fn(A) -> A + Send + Sync + 'static,
    {
        self.modify(move |a| ((), f(a)))
    }

    /// Apply `f` and return the new value.
    pub fn update_and_get<E, F>(&self, f: F) -> Effect<A, E>
    where
        E: Send + 'static,
        F: Fn(A) -> A + Send + Sync + 'static,
    {
        self.modify(move |a| {
            let next = f(a);
            (next.clone(), next)
        })
    }

    /// Apply `f` and return the previous value.
    pub fn get_and_update<E, F>(&self, f: F) -> Effect<A, E>
    where
        E: Send + 'static,
        F: Fn(A) -> A + Send + Sync + 'static,
    {
        self.modify(move |a| (a.clone(), f(a)))
    }

    /// Replace the value and return the previous one.
    pub fn get_and_set<E: Send + 'static>(&self, value: A) -> Effect<A, E> {
        self.modify(move |a| (a, value.clone()))
    }

    /// Compute a result and a new value from the current value in one step.
    pub fn modify<B, E, F>(&self, f: F) -> Effect<B, E>
    where
        B: Send + 'static,
        E: Send + 'static,
        F: Fn(A) -> (B, A) + Send + Sync + 'static,
    {
        let cell = self.clone();
        Effect::sync(move || {
            let mut slot = cell.value.lock();
            let (out, next) = f(slot.clone());
            *slot = next;
            out
        })
    }
}

impl<A: fmt::Debug> fmt::Debug for Ref<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ref").field("value", &*self.value.lock()).finish()
    }
}

// ============================================================================
// SynchronizedRef
// ============================================================================

/// A [`Ref`] whose updates may run effects, one update at a time.
pub struct SynchronizedRef<A> {
    cell: Ref<A>,
    lock: Semaphore,
}

impl<A> Clone for SynchronizedRef<A> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            lock: self.lock.clone(),
        }
    }
}

impl<A> SynchronizedRef<A>
where
    A: Clone + Send + Sync + 'static,
{
    /// Create a cell outside of any effect.
    pub fn new(initial: A) -> Self {
        Self {
            cell: Ref::new(initial),
            lock: Semaphore::new(1),
        }
    }

    /// Effect that allocates a fresh cell each time it runs.
    pub fn make<E: Send + 'static>(initial: A) -> Effect<SynchronizedRef<A>, E> {
        Effect::sync(move || SynchronizedRef::new(initial.clone()))
    }

    /// Read the current value without waiting for a running update.
    pub fn get<E: Send + 'static>(&self) -> Effect<A, E> {
        self.cell.get()
    }

    /// Replace the value once no update is running.
    pub fn set<E: Send + 'static>(&self, value: A) -> Effect<(), E> {
        self.lock.with_permit(self.cell.set(value))
    }

    /// Apply `f` once no update is running.
    pub fn update<E, F>(&self, f: F) -> Effect<(), E>
    where
        E: Send + 'static,
        F: Fn(A) -> A + Send + Sync + 'static,
    {
        self.lock.with_permit(self.cell.update(f))
    }

    /// Compute a result and a new value once no update is running.
    pub fn modify<B, E, F>(&self, f: F) -> Effect<B, E>
    where
        B: Send + 'static,
        E: Send + 'static,
        F: Fn(A) -> (B, A) + Send + Sync + 'static,
    {
        self.lock.with_permit(self.cell.modify(f))
    }

    /// Replace the value with the result of `f`'s effect.
    ///
    /// If the effect fails, the value is left unchanged.
    pub fn update_effect<E, F>(&self, f: F) -> Effect<(), E>
    where
        E: Send + 'static,
        F: Fn(A) -> Effect<A, E> + Send + Sync + 'static,
    {
        let cell = self.cell.clone();
        let body = self
            .cell
            .get()
            .flat_map(f)
            .flat_map(move |next| cell.set(next));
        self.lock.with_permit(body)
    }

    /// [`update_effect`](Self::update_effect), returning the new value.
    pub fn update_and_get_effect<E, F>(&self, f: F) -> Effect<A, E>
    where
        E: Send + 'static,
        F: Fn(A) -> Effect<A, E> + Send + Sync + 'static,
    {
        let cell = self.cell.clone();
        let body = self
            .cell
            .get()
            .flat_map(f)
            .flat_map(move |next: A| cell.set(next.clone()).as_value(next));
        self.lock.with_permit(body)
    }

    /// Compute a result and a new value with an effect, one update at a
    /// time. If the effect fails, the value is left unchanged.
    pub fn modify_effect<B, E, F>(&self, f: F) -> Effect<B, E>
    where
        B: Clone + Send + Sync + 'static,
        E: Send + 'static,
        F: Fn(A) -> Effect<(B, A), E> + Send + Sync + 'static,
    {
        let cell = self.cell.clone();
        let body = self
            .cell
            .get()
            .flat_map(f)
            .flat_map(move |(out, next)| cell.set(next).as_value(out));
        self.lock.with_permit(body)
    }
}

impl<A: fmt::Debug> fmt::Debug for SynchronizedRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynchronizedRef")
            .field("value", &*self.cell.value.lock())
            .field("lock", &self.lock)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
