//! Timer Wheel Thread
//!
//! One background thread owns every pending sleep. Fibers hand it a
//! deadline and their resumer over a crossbeam channel; the thread keeps a
//! min-heap keyed by deadline and blocks in `recv_deadline` until either a
//! new request arrives or the earliest deadline passes.
//!
//! Entries hold weak resumers. A sleeping fiber that gets interrupted is
//! resumed by the interrupt instead and released once it finishes; its
//! entry lingers as a dead weak pointer until the deadline passes or the
//! heap is pruned.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::effect::node::Node;
use crate::fiber::WeakResumer;

enum TimerCommand {
    Schedule(Instant, WeakResumer),
    Shutdown,
}

struct Entry {
    deadline: Instant,
    seq: u64,
    resumer: WeakResumer,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed: BinaryHeap is a max-heap and the earliest deadline must win.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Sending half used by fibers to request wakeups.
#[derive(Clone)]
pub(crate) struct TimerHandle {
    sender: Sender<TimerCommand>,
}

impl TimerHandle {
    pub(crate) fn schedule(&self, deadline: Instant, resumer: WeakResumer) {
        if self
            .sender
            .send(TimerCommand::Schedule(deadline, resumer))
            .is_err()
        {
            tracing::warn!("timer thread stopped; sleep will never complete");
        }
    }
}

/// The timer thread.
pub(crate) struct Timer {
    handle: TimerHandle,
    thread: Option<JoinHandle<()>>,
}

impl Timer {
    pub(crate) fn start(name: &str) -> io::Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let thread = thread::Builder::new()
            .name(format!("{}-timer", name))
            .spawn(move || run(receiver))?;
        Ok(Self {
            handle: TimerHandle { sender },
            thread: Some(thread),
        })
    }

    pub(crate) fn handle(&self) -> TimerHandle {
        self.handle.clone()
    }

    pub(crate) fn shutdown(&mut self) {
        let _ = self.handle.sender.send(TimerCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Heap size that triggers dropping entries whose fibers are gone.
const PRUNE_THRESHOLD: usize = 1024;

fn run(receiver: Receiver<TimerCommand>) {
    let mut heap: BinaryHeap<Entry> = BinaryHeap::new();
    let mut seq = 0u64;
    let mut prune_at = PRUNE_THRESHOLD;
    tracing::debug!("timer thread started");

    loop {
        let command = match heap.peek() {
            Some(next) => receiver.recv_deadline(next.deadline),
            None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match command {
            Ok(TimerCommand::Schedule(deadline, resumer)) => {
                seq += 1;
                heap.push(Entry {
                    deadline,
                    seq,
                    resumer,
                });
                if heap.len() >= prune_at {
                    heap.retain(|entry| entry.resumer.is_live());
                    prune_at = (heap.len() * 2).max(PRUNE_THRESHOLD);
                    tracing::trace!(pending = heap.len(), "pruned timer entries");
                }
            }
            Ok(TimerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        while heap.peek().is_some_and(|entry| entry.deadline <= now) {
            if let Some(entry) = heap.pop() {
                if let Some(resumer) = entry.resumer.upgrade() {
                    let _ = resumer.resume(Node::unit());
                }
            }
        }
    }

    tracing::debug!(pending = heap.len(), "timer thread stopped");
}
