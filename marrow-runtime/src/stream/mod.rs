//! # Streams
//!
//! A [`Stream<A, E>`] is a lazy, pull-based, possibly infinite sequence of
//! values delivered in [`Chunk`]s, with the same failure contract as
//! [`Effect`].
//!
//! ## Design
//!
//! - A stream is a description: running it opens a fresh [`Pull`], so the
//!   same stream can be consumed any number of times
//! - A pull answers `Some(chunk)` with more input, `None` at the end, and
//!   fails like any effect. End of stream is never a failure
//! - Consumers are [`Sink`]s. `run` drives the pull into the sink until the
//!   stream ends or the sink stops, then closes the pull whatever the
//!   outcome, interruption included
//! - Running an infinite stream to exhaustion never finishes; bound it with
//!   [`take`](Stream::take) or a sink that stops early
//! - Collection sources emit chunks of the configured
//!   [`StreamConfig::chunk_size`](crate::config::StreamConfig)
//! - Generators (`iterate`, `unfold`) and effectful stages (`map_effect`,
//!   `tap`) move one element per pull, so they never run ahead of what
//!   downstream asks for

pub mod chunk;
pub mod sink;

use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::Cause;
use crate::config::StreamConfig;
use crate::effect::Effect;
use crate::queue::Queue;

pub use self::chunk::Chunk;
pub use self::sink::Sink;

use self::sink::{SinkRun, SinkStep};

fn default_chunk_size() -> usize {
    crate::runtime_config()
        .map(|config| config.stream.chunk_size)
        .unwrap_or_else(|| StreamConfig::default().chunk_size)
}

// ============================================================================
// Pulls
// ============================================================================

/// An opened stream: pull the next chunk, or close.
pub struct Pull<A, E> {
    pull: Effect<Option<Chunk<A>>, E>,
    close: Effect<(), Infallible>,
}

impl<A, E> Clone for Pull<A, E> {
    fn clone(&self) -> Self {
        Self {
            pull: self.pull.clone(),
            close: self.close.clone(),
        }
    }
}

impl<A: Send + 'static, E: Send + 'static> Pull<A, E> {
    /// A pull with the given step and finalizer.
    pub fn new(pull: Effect<Option<Chunk<A>>, E>, close: Effect<(), Infallible>) -> Self {
        Self { pull, close }
    }

    fn unclosed(pull: Effect<Option<Chunk<A>>, E>) -> Self {
        Self::new(pull, Effect::unit())
    }

    /// Effect producing the next chunk, or `None` at the end.
    pub fn pull(&self) -> Effect<Option<Chunk<A>>, E> {
        self.pull.clone()
    }

    /// Effect releasing whatever the stream holds open.
    pub fn close(&self) -> Effect<(), Infallible> {
        self.close.clone()
    }
}

impl<A, E> fmt::Debug for Pull<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pull").finish_non_exhaustive()
    }
}

// ============================================================================
// Stream
// ============================================================================

/// A lazy sequence of `A`s that may fail with `E`.
pub struct Stream<A, E = Infallible> {
    open: Effect<Pull<A, E>, E>,
}

impl<A, E> Clone for Stream<A, E> {
    fn clone(&self) -> Self {
        Self {
            open: self.open.clone(),
        }
    }
}

impl<A, E> fmt::Debug for Stream<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").finish_non_exhaustive()
    }
}

impl<A, E> Stream<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    /// A stream opened by running `open`.
    pub fn from_pull(open: Effect<Pull<A, E>, E>) -> Self {
        Self { open }
    }

    /// Build from a factory of iterators, batched into chunks. The factory
    /// runs once per consumption.
    fn from_iter_with<It, F>(make: F) -> Self
    where
        It: Iterator<Item = A> + Send + 'static,
        F: Fn() -> It + Send + Sync + 'static,
    {
        Self::from_pull(Effect::sync(move || {
            let size = default_chunk_size();
            let iter = Arc::new(Mutex::new(make()));
            Pull::unclosed(Effect::sync(move || {
                let chunk: Chunk<A> = iter.lock().by_ref().take(size).collect();
                if chunk.is_empty() {
                    None
                } else {
                    Some(chunk)
                }
            }))
        }))
    }

    /// A stream with no elements.
    pub fn empty() -> Self {
        Self::from_pull(Effect::sync(|| Pull::unclosed(Effect::sync(|| None))))
    }

    /// A stream of one element.
    pub fn succeed(value: A) -> Self
    where
        A: Clone + Sync,
    {
        Self::from_chunk(Chunk::single(value))
    }

    /// A stream emitting `chunk` as is.
    pub fn from_chunk(chunk: Chunk<A>) -> Self
    where
        A: Clone + Sync,
    {
        Self::from_pull(Effect::sync(move || {
            let slot = Arc::new(Mutex::new(Some(chunk.clone())));
            Pull::unclosed(Effect::sync(move || slot.lock().take().filter(|c| !c.is_empty())))
        }))
    }

    /// A stream over a collection, re-iterated on every consumption.
    pub fn from_iterable<I>(items: I) -> Self
    where
        I: IntoIterator<Item = A> + Clone + Send + Sync + 'static,
        I::IntoIter: Send + 'static,
    {
        Self::from_iter_with(move || items.clone().into_iter())
    }

    /// A stream of the given values.
    pub fn make(items: impl IntoIterator<Item = A>) -> Self
    where
        A: Clone + Sync,
    {
        Self::from_iterable(items.into_iter().collect::<Vec<_>>())
    }

    /// `init`, `f(init)`, `f(f(init))`, and so on, forever.
    ///
    /// `f` runs once per element pulled after the first.
    pub fn iterate<F>(init: A, f: F) -> Self
    where
        A: Clone + Sync,
        F: Fn(&A) -> A + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::from_pull(Effect::sync(move || {
            let (f, init) = (Arc::clone(&f), init.clone());
            let last: Arc<Mutex<Option<A>>> = Arc::new(Mutex::new(None));
            Pull::unclosed(Effect::sync(move || {
                let mut last = last.lock();
                let next = match last.as_ref() {
                    None => init.clone(),
                    Some(previous) => f(previous),
                };
                *last = Some(next.clone());
                Some(Chunk::single(next))
            }))
        }))
    }

    /// Grow a stream from a seed. Ends when `f` returns `None`.
    pub fn unfold<S, F>(init: S, f: F) -> Self
    where
        S: Clone + Send + Sync + 'static,
        F: Fn(S) -> Option<(A, S)> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::from_pull(Effect::sync(move || {
            let f = Arc::clone(&f);
            let state = Arc::new(Mutex::new(Some(init.clone())));
            Pull::unclosed(Effect::sync(move || {
                let mut state = state.lock();
                let (value, next) = f(state.take()?)?;
                *state = Some(next);
                Some(Chunk::single(value))
            }))
        }))
    }

    /// A stream of the single value produced by `effect`.
    pub fn from_effect(effect: Effect<A, E>) -> Self {
        Self::from_pull(Effect::sync(move || {
            let effect = effect.clone();
            let pulled = Arc::new(AtomicBool::new(false));
            Pull::unclosed(Effect::suspend(move || {
                if pulled.swap(true, Ordering::AcqRel) {
                    Effect::ready(None)
                } else {
                    effect.clone().map(|value| Some(Chunk::single(value)))
                }
            }))
        }))
    }

    /// An endless stream of the values produced by running `effect` again
    /// and again.
    pub fn repeat_effect(effect: Effect<A, E>) -> Self {
        Self::from_pull(Effect::sync(move || {
            Pull::unclosed(effect.clone().map(|value| Some(Chunk::single(value))))
        }))
    }

    /// A stream fed by a callback-based producer.
    ///
    /// `register` runs when the stream is opened and receives an [`Emit`]
    /// handle that may be used from any thread. The cleanup effect it may
    /// return runs when consumption stops, for whatever reason.
    pub fn async_emit<F>(register: F) -> Self
    where
        F: Fn(Emit<A, E>) -> Option<Effect<(), Infallible>> + Send + Sync + 'static,
    {
        Self::from_pull(Effect::sync(move || {
            let queue = Queue::unbounded();
            let emit = Emit {
                queue: queue.clone(),
                done: Arc::new(AtomicBool::new(false)),
            };
            let cleanup = register(emit).unwrap_or_else(Effect::unit);
            let pull = queue.take().flat_map(|signal| match signal {
                Some(Signal::Chunk(chunk)) => Effect::ready(Some(chunk)),
                Some(Signal::Fail(error)) => Effect::ready_cause(Cause::Fail(error)),
                Some(Signal::End) | None => Effect::ready(None),
            });
            Pull::new(pull, cleanup.zip_right(queue.shutdown()))
        }))
    }

    /// A stream of chunks produced by `f` from each chunk of this stream.
    pub fn map_chunks<B, F>(self, f: F) -> Stream<B, E>
    where
        B: Send + 'static,
        F: Fn(Chunk<A>) -> Chunk<B> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Stream::from_pull(self.open.map(move |pull: Pull<A, E>| {
            let f = Arc::clone(&f);
            Pull::new(pull.pull.map(move |next| next.map(|chunk| f(chunk))), pull.close)
        }))
    }

    /// Transform every element.
    pub fn map<B, F>(self, f: F) -> Stream<B, E>
    where
        B: Send + 'static,
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        self.map_chunks(move |chunk| chunk.map(&f))
    }

    /// Keep the elements matching `pred`. Chunks left empty are skipped.
    pub fn filter<P>(self, pred: P) -> Self
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
    {
        fn skip_empty<A, E, P>(pull: Effect<Option<Chunk<A>>, E>, pred: Arc<P>) -> Effect<Option<Chunk<A>>, E>
        where
            A: Send + 'static,
            E: Send + 'static,
            P: Fn(&A) -> bool + Send + Sync + 'static,
        {
            let again = pull.clone();
            pull.flat_map(move |next| match next {
                None => Effect::ready(None),
                Some(chunk) => {
                    let kept = chunk.filter(|a| pred(a));
                    if kept.is_empty() {
                        skip_empty(again.clone(), Arc::clone(&pred))
                    } else {
                        Effect::ready(Some(kept))
                    }
                }
            })
        }

        let pred = Arc::new(pred);
        Self::from_pull(self.open.map(move |pull: Pull<A, E>| {
            Pull::new(skip_empty(pull.pull, Arc::clone(&pred)), pull.close)
        }))
    }

    /// Replace every element by the result of `f`'s effect, in order.
    ///
    /// Each pull runs `f` for one element only; the rest of an upstream
    /// chunk waits for the next pull.
    pub fn map_effect<B, F>(self, f: F) -> Stream<B, E>
    where
        B: Send + 'static,
        F: Fn(A) -> Effect<B, E> + Send + Sync + 'static,
    {
        fn step<A, B, E, F>(
            upstream: Effect<Option<Chunk<A>>, E>,
            pending: Arc<Mutex<VecDeque<A>>>,
            f: Arc<F>,
        ) -> Effect<Option<Chunk<B>>, E>
        where
            A: Send + 'static,
            B: Send + 'static,
            E: Send + 'static,
            F: Fn(A) -> Effect<B, E> + Send + Sync + 'static,
        {
            Effect::suspend(move || {
                let next = pending.lock().pop_front();
                if let Some(a) = next {
                    return f(a).map(|b| Some(Chunk::single(b)));
                }
                let (again, pending, f) = (upstream.clone(), Arc::clone(&pending), Arc::clone(&f));
                upstream.clone().flat_map_once(move |next| match next {
                    None => Effect::ready(None),
                    Some(chunk) => {
                        pending.lock().extend(chunk);
                        step(again, pending, f)
                    }
                })
            })
        }

        let f = Arc::new(f);
        Stream::from_pull(self.open.map(move |pull: Pull<A, E>| {
            let pending = Arc::new(Mutex::new(VecDeque::new()));
            Pull::new(step(pull.pull, pending, Arc::clone(&f)), pull.close)
        }))
    }

    /// Run `f`'s effect for every element as it passes through.
    pub fn tap<X, F>(self, f: F) -> Self
    where
        X: Send + 'static,
        F: Fn(&A) -> Effect<X, E> + Send + Sync + 'static,
    {
        self.map_effect(move |a| f(&a).flat_map_once(move |_| Effect::ready(a)))
    }

    /// The first `n` elements. Upstream is not pulled once they are out.
    pub fn take(self, n: usize) -> Self {
        Self::from_pull(self.open.map(move |pull: Pull<A, E>| {
            let remaining = Arc::new(Mutex::new(n));
            let upstream = pull.pull;
            let step = Effect::suspend(move || {
                if *remaining.lock() == 0 {
                    return Effect::ready(None);
                }
                let remaining = Arc::clone(&remaining);
                upstream.clone().map(move |next| {
                    next.map(|chunk| {
                        let mut remaining = remaining.lock();
                        let (head, _) = chunk.split_at(*remaining);
                        *remaining -= head.len();
                        head
                    })
                })
            });
            Pull::new(step, pull.close)
        }))
    }

    /// Elements up to, not including, the first one failing `pred`.
    pub fn take_while<P>(self, pred: P) -> Self
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
    {
        let pred = Arc::new(pred);
        Self::from_pull(self.open.map(move |pull: Pull<A, E>| {
            let pred = Arc::clone(&pred);
            let stopped = Arc::new(AtomicBool::new(false));
            let upstream = pull.pull;
            let step = Effect::suspend(move || {
                if stopped.load(Ordering::Acquire) {
                    return Effect::ready(None);
                }
                let (pred, stopped) = (Arc::clone(&pred), Arc::clone(&stopped));
                upstream.clone().map(move |next| {
                    next.map(|chunk| {
                        let mut kept = Vec::with_capacity(chunk.len());
                        for item in chunk {
                            if !pred(&item) {
                                stopped.store(true, Ordering::Release);
                                break;
                            }
                            kept.push(item);
                        }
                        Chunk::from_vec(kept)
                    })
                })
            });
            Pull::new(step, pull.close)
        }))
    }

    /// Re-batch the elements into chunks of `size` (the last may be
    /// shorter).
    pub fn rechunk(self, size: usize) -> Self {
        let size = size.max(1);
        Self::from_pull(self.open.map(move |pull: Pull<A, E>| {
            let buffer = Arc::new(Mutex::new(Rechunk {
                items: Vec::new(),
                ended: false,
            }));
            Pull::new(rechunk_pull(pull.pull, size, buffer), pull.close)
        }))
    }

    /// This stream's elements followed by `that`'s.
    pub fn concat(self, that: Stream<A, E>) -> Self {
        Self::concat_all(vec![self, that])
    }

    /// The elements of every stream, one stream after the other. Each
    /// stream is opened when the previous one ends and closed before the
    /// next one opens.
    pub fn concat_all(streams: Vec<Stream<A, E>>) -> Self {
        let streams = Arc::new(streams);
        Self::from_pull(Effect::sync(move || {
            let state = Arc::new(Mutex::new(ConcatState {
                next: 0,
                current: None,
            }));
            let closing = Arc::clone(&state);
            let close = Effect::suspend(move || match closing.lock().current.take() {
                Some(pull) => pull.close,
                None => Effect::unit(),
            });
            Pull::new(concat_pull(Arc::clone(&streams), state), close)
        }))
    }

    // ------------------------------------------------------------------------
    // Running
    // ------------------------------------------------------------------------

    /// Feed the stream into `sink` and return the sink's result.
    ///
    /// The stream is closed when the run ends, however it ends. Input the
    /// sink leaves over is dropped.
    pub fn run<Out>(&self, sink: Sink<A, Out, E>) -> Effect<Out, E>
    where
        Out: Send + 'static,
    {
        let open = self.open.clone();
        Effect::uninterruptible_mask(move |restore| {
            let sink = sink.start();
            open.clone().flat_map_once(move |pull: Pull<A, E>| {
                restore.restore(drive(pull.pull, sink)).ensuring(pull.close)
            })
        })
    }

    /// Collect every element.
    pub fn run_collect(&self) -> Effect<Chunk<A>, E> {
        self.run(Sink::collect_all())
    }

    /// Consume the stream for its effects.
    pub fn run_drain(&self) -> Effect<(), E> {
        self.run(Sink::drain())
    }

    /// Fold every element into a state.
    pub fn run_fold<S, F>(&self, init: S, f: F) -> Effect<S, E>
    where
        S: Clone + Send + Sync + 'static,
        F: Fn(S, A) -> S + Send + Sync + 'static,
    {
        self.run(Sink::fold(init, f))
    }

    /// Run `f`'s effect for every element, in order.
    pub fn run_for_each<X, F>(&self, f: F) -> Effect<(), E>
    where
        X: Send + 'static,
        F: Fn(A) -> Effect<X, E> + Send + Sync + 'static,
    {
        self.run(Sink::for_each(f))
    }
}

impl<E: Send + 'static> Stream<i64, E> {
    /// The integers from `start` to `end`, both included.
    pub fn range(start: i64, end: i64) -> Self {
        Self::from_iter_with(move || start..=end)
    }
}

fn drive<A, Out, E>(pull: Effect<Option<Chunk<A>>, E>, sink: SinkRun<A, Out, E>) -> Effect<Out, E>
where
    A: Send + 'static,
    Out: Send + 'static,
    E: Send + 'static,
{
    pull.clone().flat_map_once(move |next| match next {
        None => (sink.finish)(),
        Some(chunk) => (sink.push)(chunk).flat_map_once(move |step| match step {
            SinkStep::More => drive(pull, sink),
            SinkStep::Done(out, _leftover) => Effect::ready(out),
        }),
    })
}

struct Rechunk<A> {
    items: Vec<A>,
    ended: bool,
}

impl<A> Rechunk<A> {
    fn emit(&mut self, size: usize) -> Option<Chunk<A>> {
        if self.items.len() >= size {
            let rest = self.items.split_off(size);
            Some(Chunk::from_vec(std::mem::replace(&mut self.items, rest)))
        } else if self.ended && !self.items.is_empty() {
            Some(Chunk::from_vec(std::mem::take(&mut self.items)))
        } else {
            None
        }
    }
}

fn rechunk_pull<A, E>(
    upstream: Effect<Option<Chunk<A>>, E>,
    size: usize,
    buffer: Arc<Mutex<Rechunk<A>>>,
) -> Effect<Option<Chunk<A>>, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    Effect::suspend(move || {
        {
            let mut buffered = buffer.lock();
            if let Some(chunk) = buffered.emit(size) {
                return Effect::ready(Some(chunk));
            }
            if buffered.ended {
                return Effect::ready(None);
            }
        }
        let (again, buffer) = (upstream.clone(), Arc::clone(&buffer));
        upstream.clone().flat_map_once(move |next| {
            match next {
                Some(chunk) => buffer.lock().items.extend(chunk),
                None => buffer.lock().ended = true,
            }
            rechunk_pull(again, size, buffer)
        })
    })
}

struct ConcatState<A, E> {
    next: usize,
    current: Option<Pull<A, E>>,
}

fn concat_pull<A, E>(
    streams: Arc<Vec<Stream<A, E>>>,
    state: Arc<Mutex<ConcatState<A, E>>>,
) -> Effect<Option<Chunk<A>>, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    Effect::suspend(move || {
        let (streams, state) = (Arc::clone(&streams), Arc::clone(&state));
        let current = state.lock().current.clone();
        match current {
            Some(pull) => pull.pull.flat_map_once(move |next| match next {
                Some(chunk) => Effect::ready(Some(chunk)),
                None => {
                    let finished = state.lock().current.take();
                    let close = finished.map_or_else(Effect::<(), Infallible>::unit, |pull| pull.close);
                    close
                        .widen::<E>()
                        .flat_map_once(move |()| concat_pull(streams, state))
                }
            }),
            None => {
                let index = {
                    let mut state = state.lock();
                    let index = state.next;
                    state.next = state.next.saturating_add(1);
                    index
                };
                match streams.get(index).map(|stream| stream.open.clone()) {
                    None => Effect::ready(None),
                    Some(open) => open.flat_map_once(move |pull| {
                        state.lock().current = Some(pull);
                        concat_pull(streams, state)
                    }),
                }
            }
        }
    })
}

// ============================================================================
// Async sources
// ============================================================================

enum Signal<A, E> {
    Chunk(Chunk<A>),
    Fail(E),
    End,
}

/// Pushes values into a stream built with [`Stream::async_emit`].
///
/// Every method returns false once the stream has ended, failed or
/// stopped being consumed.
pub struct Emit<A, E> {
    queue: Queue<Signal<A, E>>,
    done: Arc<AtomicBool>,
}

impl<A, E> Clone for Emit<A, E> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            done: Arc::clone(&self.done),
        }
    }
}

impl<A: Send + 'static, E: Send + 'static> Emit<A, E> {
    fn send(&self, signal: Signal<A, E>) -> bool {
        !self.done.load(Ordering::Acquire) && self.queue.try_offer(signal).is_ok()
    }

    fn finish(&self, signal: Signal<A, E>) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        let sent = self.queue.try_offer(signal).is_ok();
        self.queue.shutdown_now();
        sent
    }

    /// Emit one value.
    pub fn single(&self, value: A) -> bool {
        self.send(Signal::Chunk(Chunk::single(value)))
    }

    /// Emit a chunk of values.
    pub fn chunk(&self, chunk: Chunk<A>) -> bool {
        chunk.is_empty() || self.send(Signal::Chunk(chunk))
    }

    /// Fail the stream.
    pub fn fail(&self, error: E) -> bool {
        self.finish(Signal::Fail(error))
    }

    /// End the stream.
    pub fn end(&self) -> bool {
        self.finish(Signal::End)
    }

    /// Returns true once the stream can take no more input.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire) || self.queue.is_shutdown()
    }
}

impl<A: Send + 'static, E: Send + 'static> fmt::Debug for Emit<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emit")
            .field("queue", &self.queue.id())
            .field("done", &self.done.load(Ordering::Relaxed))
            .finish()
    }
}
