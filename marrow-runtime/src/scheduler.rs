//! # Work-Stealing Fiber Scheduler
//!
//! M:N cooperative scheduler with work-stealing.
//!
//! ## Design
//!
//! - Multiple worker threads each with a local deque
//! - A global injector receives every newly runnable fiber
//! - Workers refill their deque from the injector in batches and, when
//!   enabled, steal from siblings
//! - A fiber runs for at most `ops_before_yield` interpreter steps per
//!   slice; a fiber that yields goes to the back of the injector
//! - Idle workers park on a condition variable with a bounded wait
//!
//! ## Technical References
//!
//! - [Chase-Lev Deque](https://doi.org/10.1145/1073970.1073974)
//! - [crossbeam-deque](https://docs.rs/crossbeam-deque)
//! - [Tokio Scheduler](https://tokio.rs/blog/2019-10-scheduler)

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer, Worker as Deque};
use parking_lot::{Condvar, Mutex};

use crate::config::SchedulerConfig;
use crate::fiber::FiberRef;
use crate::interpreter::SliceOutcome;

/// State shared by every worker of one pool.
struct PoolShared {
    /// Global injection queue.
    injector: Injector<FiberRef>,
    /// Stealers for work-stealing.
    stealers: Vec<Stealer<FiberRef>>,
    /// Shutdown flag.
    shutdown: AtomicBool,
    /// Number of workers currently running their loop.
    active_workers: AtomicUsize,
    idle_lock: Mutex<()>,
    idle_cv: Condvar,
}

impl PoolShared {
    fn notify_one(&self) {
        // Taking the lock orders this wakeup after a worker's emptiness check.
        drop(self.idle_lock.lock());
        self.idle_cv.notify_one();
    }
}

/// Work-stealing scheduler for fibers.
pub(crate) struct Scheduler {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    num_workers: usize,
}

impl Scheduler {
    /// Start `config.num_workers` worker threads.
    pub(crate) fn start(config: &SchedulerConfig) -> io::Result<Self> {
        let num_workers = config.num_workers.max(1);

        // Create worker deques and collect stealers
        let mut deques = Vec::with_capacity(num_workers);
        let mut stealers = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let deque = Deque::new_fifo();
            stealers.push(deque.stealer());
            deques.push(deque);
        }

        let shared = Arc::new(PoolShared {
            injector: Injector::new(),
            stealers,
            shutdown: AtomicBool::new(false),
            active_workers: AtomicUsize::new(0),
            idle_lock: Mutex::new(()),
            idle_cv: Condvar::new(),
        });

        let scheduler = Self {
            shared: Arc::clone(&shared),
            threads: Mutex::new(Vec::with_capacity(num_workers)),
            num_workers,
        };

        for (id, deque) in deques.into_iter().enumerate() {
            let worker = Worker {
                id,
                shared: Arc::clone(&shared),
                ops_before_yield: config.ops_before_yield.max(1),
                work_stealing: config.work_stealing,
                idle_park: config.idle_park,
            };
            let spawned = thread::Builder::new()
                .name(format!("{}-worker-{}", config.thread_name_prefix, id))
                .spawn(move || worker.run_loop(deque));
            match spawned {
                Ok(handle) => scheduler.threads.lock().push(handle),
                Err(e) => {
                    scheduler.shutdown();
                    return Err(e);
                }
            }
        }

        tracing::debug!(workers = num_workers, "scheduler started");
        Ok(scheduler)
    }

    /// Get the number of workers.
    pub(crate) fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Make a fiber runnable.
    pub(crate) fn push(&self, fiber: FiberRef) {
        if self.is_shutting_down() {
            tracing::trace!(fiber = %fiber.id(), "scheduler stopped; fiber dropped");
            return;
        }
        self.shared.injector.push(fiber);
        self.shared.notify_one();
    }

    /// Check if the scheduler is shutting down.
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Number of workers currently inside their run loop.
    pub(crate) fn active_workers(&self) -> usize {
        self.shared.active_workers.load(Ordering::Acquire)
    }

    /// Stop every worker and drop any fibers still queued.
    pub(crate) fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _guard = self.shared.idle_lock.lock();
            self.shared.idle_cv.notify_all();
        }

        let current = thread::current().id();
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }

        let mut dropped = 0usize;
        loop {
            match self.shared.injector.steal() {
                Steal::Success(_) => dropped += 1,
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
        tracing::debug!(dropped, "scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A worker thread in the scheduler.
struct Worker {
    id: usize,
    shared: Arc<PoolShared>,
    ops_before_yield: usize,
    work_stealing: bool,
    idle_park: Duration,
}

impl Worker {
    /// Run the worker loop.
    fn run_loop(self, local: Deque<FiberRef>) {
        self.shared.active_workers.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(worker = self.id, "worker started");

        loop {
            // Check for shutdown
            if self.shared.shutdown.load(Ordering::Acquire) {
                break;
            }

            // Try to get work
            if let Some(fiber) = self.find_work(&local) {
                self.run_fiber(fiber);
            } else {
                self.park();
            }
        }

        self.shared.active_workers.fetch_sub(1, Ordering::AcqRel);
        tracing::trace!(worker = self.id, "worker stopped");
    }

    /// Find work using work-stealing.
    fn find_work(&self, local: &Deque<FiberRef>) -> Option<FiberRef> {
        // 1. Try local queue first
        if let Some(fiber) = local.pop() {
            return Some(fiber);
        }

        // 2. Refill from the global queue
        loop {
            match self.shared.injector.steal_batch_and_pop(local) {
                Steal::Success(fiber) => return Some(fiber),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        // 3. Try stealing from other workers
        if self.work_stealing {
            for (id, stealer) in self.shared.stealers.iter().enumerate() {
                if id == self.id {
                    continue;
                }
                loop {
                    match stealer.steal() {
                        Steal::Success(fiber) => return Some(fiber),
                        Steal::Empty => break,
                        Steal::Retry => continue,
                    }
                }
            }
        }

        None
    }

    fn park(&self) {
        let mut guard = self.shared.idle_lock.lock();
        if self.shared.injector.is_empty() && !self.shared.shutdown.load(Ordering::Acquire) {
            let _ = self.shared.idle_cv.wait_for(&mut guard, self.idle_park);
        }
    }

    /// Run one slice of a fiber.
    fn run_fiber(&self, fiber: FiberRef) {
        match fiber.run_slice(Some(self.ops_before_yield)) {
            SliceOutcome::Yielded => {
                self.shared.injector.push(fiber);
                self.shared.notify_one();
            }
            SliceOutcome::Done | SliceOutcome::Parked => {}
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn config(workers: usize) -> SchedulerConfig {
        SchedulerConfig {
            num_workers: workers,
            thread_name_prefix: "sched-test".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_scheduler_creation() {
        let scheduler = Scheduler::start(&config(2)).unwrap();
        assert_eq!(scheduler.num_workers(), 2);
        scheduler.shutdown();
        assert!(scheduler.is_shutting_down());
        assert_eq!(scheduler.active_workers(), 0);
    }

    #[test]
    fn test_zero_workers_clamped() {
        let scheduler = Scheduler::start(&config(0)).unwrap();
        assert_eq!(scheduler.num_workers(), 1);
    }

    #[test]
    fn test_shutdown_idempotent() {
        let scheduler = Scheduler::start(&config(1)).unwrap();
        scheduler.shutdown();
        scheduler.shutdown();
        assert!(scheduler.is_shutting_down());
    }
}
