//! Sinks: consumers that fold a stream's chunks into a result.
//!
//! A sink is a factory. Each run of a stream gets fresh sink state, receives
//! chunks one at a time and may stop early, handing back the part of the
//! last chunk it did not consume as leftover.

use std::convert::Infallible;
use std::fmt;
use std::ops::Add;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::{Cause, Defect};
use crate::effect::{Concurrency, Effect};

use super::chunk::Chunk;

/// Answer of a sink to one chunk.
pub(crate) enum SinkStep<In, Out> {
    /// Send more input.
    More,
    /// Finished, with the unconsumed rest of the chunk.
    Done(Out, Chunk<In>),
}

type PushFn<In, Out, E> = Arc<dyn Fn(Chunk<In>) -> Effect<SinkStep<In, Out>, E> + Send + Sync>;
type FinishFn<Out, E> = Arc<dyn Fn() -> Effect<Out, E> + Send + Sync>;

/// The state of one sink run.
pub(crate) struct SinkRun<In, Out, E> {
    pub(crate) push: PushFn<In, Out, E>,
    pub(crate) finish: FinishFn<Out, E>,
}

impl<In, Out, E> Clone for SinkRun<In, Out, E> {
    fn clone(&self) -> Self {
        Self {
            push: Arc::clone(&self.push),
            finish: Arc::clone(&self.finish),
        }
    }
}

/// A consumer of `In` elements producing `Out`.
pub struct Sink<In, Out, E = Infallible> {
    make: Arc<dyn Fn() -> SinkRun<In, Out, E> + Send + Sync>,
}

impl<In, Out, E> Clone for Sink<In, Out, E> {
    fn clone(&self) -> Self {
        Self {
            make: Arc::clone(&self.make),
        }
    }
}

impl<In, Out, E> fmt::Debug for Sink<In, Out, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink").finish_non_exhaustive()
    }
}

fn consumed<Out: Send + 'static, E: Send + 'static>() -> Effect<Out, E> {
    Effect::ready_cause(Cause::Die(Defect::new("sink state already consumed")))
}

impl<In, Out, E> Sink<In, Out, E>
where
    In: Send + 'static,
    Out: Send + 'static,
    E: Send + 'static,
{
    fn from_run<M>(make: M) -> Self
    where
        M: Fn() -> SinkRun<In, Out, E> + Send + Sync + 'static,
    {
        Self {
            make: Arc::new(make),
        }
    }

    pub(crate) fn start(&self) -> SinkRun<In, Out, E> {
        (self.make)()
    }

    /// Fold every element into a state.
    pub fn fold<F>(init: Out, f: F) -> Self
    where
        Out: Clone + Sync,
        F: Fn(Out, In) -> Out + Send + Sync + 'static,
    {
        Self::fold_while(init, |_| true, f)
    }

    /// Fold while `cont` holds for the state. Elements after the state
    /// stops satisfying `cont` are left over.
    pub fn fold_while<C, F>(init: Out, cont: C, f: F) -> Self
    where
        Out: Clone + Sync,
        C: Fn(&Out) -> bool + Send + Sync + 'static,
        F: Fn(Out, In) -> Out + Send + Sync + 'static,
    {
        let cont = Arc::new(cont);
        let f = Arc::new(f);
        Self::from_run(move || {
            let state = Arc::new(Mutex::new(Some(init.clone())));
            let finished = Arc::clone(&state);
            let (cont, f) = (Arc::clone(&cont), Arc::clone(&f));
            SinkRun {
                push: Arc::new(move |chunk: Chunk<In>| {
                    let mut slot = state.lock();
                    let Some(mut acc) = slot.take() else {
                        return consumed();
                    };
                    let mut items = chunk.into_iter();
                    while cont(&acc) {
                        match items.next() {
                            Some(item) => acc = f(acc, item),
                            None => {
                                *slot = Some(acc);
                                return Effect::ready(SinkStep::More);
                            }
                        }
                    }
                    Effect::ready(SinkStep::Done(acc, items.collect()))
                }),
                finish: Arc::new(move || match finished.lock().take() {
                    Some(acc) => Effect::ready(acc),
                    None => consumed(),
                }),
            }
        })
    }

    /// Transform the result.
    pub fn map<Out2, F>(self, f: F) -> Sink<In, Out2, E>
    where
        Out2: Send + 'static,
        F: Fn(Out) -> Out2 + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Sink::from_run(move || {
            let run = self.start();
            let (on_push, on_finish) = (Arc::clone(&f), Arc::clone(&f));
            let finish = Arc::clone(&run.finish);
            SinkRun {
                push: Arc::new(move |chunk: Chunk<In>| {
                    let on_push = Arc::clone(&on_push);
                    (run.push)(chunk).map(move |step| match step {
                        SinkStep::More => SinkStep::More,
                        SinkStep::Done(out, leftover) => SinkStep::Done(on_push(out), leftover),
                    })
                }),
                finish: Arc::new(move || {
                    let on_finish = Arc::clone(&on_finish);
                    finish().map(move |out| on_finish(out))
                }),
            }
        })
    }

    /// Also return the input left over when the sink stopped early.
    pub fn collect_leftover(self) -> Sink<In, (Out, Chunk<In>), E>
    where
        In: Clone,
    {
        Sink::from_run(move || {
            let run = self.start();
            let finish = Arc::clone(&run.finish);
            SinkRun {
                push: Arc::new(move |chunk: Chunk<In>| {
                    (run.push)(chunk).map(|step| match step {
                        SinkStep::More => SinkStep::More,
                        SinkStep::Done(out, leftover) => {
                            SinkStep::Done((out, leftover.clone()), leftover)
                        }
                    })
                }),
                finish: Arc::new(move || finish().map(|out| (out, Chunk::empty()))),
            }
        })
    }
}

impl<In: Send + 'static, E: Send + 'static> Sink<In, Chunk<In>, E> {
    /// Collect every element.
    pub fn collect_all() -> Self {
        Self::from_run(|| {
            let items = Arc::new(Mutex::new(Vec::new()));
            let finished = Arc::clone(&items);
            SinkRun {
                push: Arc::new(move |chunk: Chunk<In>| {
                    items.lock().extend(chunk);
                    Effect::ready(SinkStep::More)
                }),
                finish: Arc::new(move || {
                    Effect::ready(Chunk::from_vec(std::mem::take(&mut *finished.lock())))
                }),
            }
        })
    }

    /// Collect the first `n` elements and stop.
    pub fn take(n: usize) -> Self {
        Self::from_run(move || {
            let items = Arc::new(Mutex::new(Vec::new()));
            let finished = Arc::clone(&items);
            SinkRun {
                push: Arc::new(move |chunk: Chunk<In>| {
                    let mut items = items.lock();
                    let wanted = n.saturating_sub(items.len());
                    let (head, rest) = chunk.split_at(wanted);
                    items.extend(head);
                    if items.len() >= n {
                        Effect::ready(SinkStep::Done(
                            Chunk::from_vec(std::mem::take(&mut *items)),
                            rest,
                        ))
                    } else {
                        Effect::ready(SinkStep::More)
                    }
                }),
                finish: Arc::new(move || {
                    Effect::ready(Chunk::from_vec(std::mem::take(&mut *finished.lock())))
                }),
            }
        })
    }
}

impl<In: Send + 'static, E: Send + 'static> Sink<In, Option<In>, E> {
    /// The first element; the rest is left over.
    pub fn head() -> Self {
        Self::from_run(|| SinkRun {
            push: Arc::new(|chunk: Chunk<In>| {
                let mut items = chunk.into_iter();
                match items.next() {
                    Some(first) => Effect::ready(SinkStep::Done(Some(first), items.collect())),
                    None => Effect::ready(SinkStep::More),
                }
            }),
            finish: Arc::new(|| Effect::ready(None)),
        })
    }

    /// The last element.
    pub fn last() -> Self {
        Self::from_run(|| {
            let last = Arc::new(Mutex::new(None));
            let finished = Arc::clone(&last);
            SinkRun {
                push: Arc::new(move |chunk: Chunk<In>| {
                    if let Some(item) = chunk.into_iter().last() {
                        *last.lock() = Some(item);
                    }
                    Effect::ready(SinkStep::More)
                }),
                finish: Arc::new(move || Effect::ready(finished.lock().take())),
            }
        })
    }
}

impl<In, E> Sink<In, In, E>
where
    In: Add<Output = In> + Default + Clone + Send + Sync + 'static,
    E: Send + 'static,
{
    /// Add up every element.
    pub fn sum() -> Self {
        Self::fold(In::default(), |acc, item| acc + item)
    }
}

impl<In: Send + 'static, E: Send + 'static> Sink<In, usize, E> {
    /// Count the elements.
    pub fn count() -> Self {
        Self::fold(0, |n, _| n + 1)
    }
}

impl<In: Send + 'static, E: Send + 'static> Sink<In, (), E> {
    /// Consume and discard every element.
    pub fn drain() -> Self {
        Self::from_run(|| SinkRun {
            push: Arc::new(|_: Chunk<In>| Effect::ready(SinkStep::More)),
            finish: Arc::new(Effect::<(), E>::unit),
        })
    }

    /// Run `f`'s effect for every element, in order.
    pub fn for_each<X, F>(f: F) -> Self
    where
        X: Send + 'static,
        F: Fn(In) -> Effect<X, E> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::from_run(move || {
            let f = Arc::clone(&f);
            SinkRun {
                push: Arc::new(move |chunk: Chunk<In>| {
                    let f = Arc::clone(&f);
                    Effect::for_each(chunk, move |item| f(item), Concurrency::Sequential)
                        .map(|_| SinkStep::More)
                }),
                finish: Arc::new(Effect::<(), E>::unit),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;

    fn runtime() -> Runtime {
        Runtime::new(
            RuntimeConfig::builder()
                .num_workers(1)
                .thread_name_prefix("sink-test")
                .build()
                .unwrap(),
        )
        .unwrap()
    }

    /// Feed chunks to a sink by hand, the way a stream run would.
    fn feed<In, Out>(sink: &Sink<In, Out, String>, chunks: Vec<Vec<In>>) -> Effect<Out, String>
    where
        In: Send + 'static,
        Out: Send + 'static,
    {
        let run = sink.start();
        let mut program: Effect<Option<Out>, String> = Effect::ready(None);
        for chunk in chunks {
            let run = run.clone();
            let chunk = Mutex::new(Some(Chunk::from_vec(chunk)));
            program = program.flat_map(move |done| match done {
                Some(out) => Effect::ready(Some(out)),
                None => match chunk.lock().take() {
                    Some(chunk) => (run.push)(chunk).map(|step| match step {
                        SinkStep::More => None,
                        SinkStep::Done(out, _) => Some(out),
                    }),
                    None => Effect::ready(None),
                },
            });
        }
        program.flat_map(move |done| match done {
            Some(out) => Effect::ready(out),
            None => (run.finish)(),
        })
    }

    #[test]
    fn test_fold_sum_count() {
        let rt = runtime();
        assert_eq!(rt.run_sync(feed(&Sink::sum(), vec![vec![1, 2], vec![3]])), Ok(6));
        assert_eq!(rt.run_sync(feed(&Sink::<i32, usize, String>::count(), vec![vec![1, 2], vec![3]])), Ok(3));
        let joined = Sink::fold(String::new(), |acc: String, s: &str| acc + s);
        assert_eq!(rt.run_sync(feed(&joined, vec![vec!["a", "b"], vec!["c"]])), Ok("abc".to_string()));
    }

    #[test]
    fn test_fold_while_leaves_leftover() {
        let rt = runtime();
        let sink = Sink::fold_while(0, |acc| *acc < 5, |acc, n| acc + n).collect_leftover();
        assert_eq!(
            rt.run_sync(feed(&sink, vec![vec![2, 2, 2, 2]])),
            Ok((6, Chunk::from_vec(vec![2])))
        );
    }

    #[test]
    fn test_head_collect_leftover() {
        let rt = runtime();
        let sink = Sink::<i32, Option<i32>, String>::head().collect_leftover();
        assert_eq!(
            rt.run_sync(feed(&sink, vec![vec![1, 2, 3]])),
            Ok((Some(1), Chunk::from_vec(vec![2, 3])))
        );
        assert_eq!(rt.run_sync(feed(&sink, vec![])), Ok((None, Chunk::empty())));
    }

    #[test]
    fn test_last_take_collect() {
        let rt = runtime();
        assert_eq!(rt.run_sync(feed(&Sink::last(), vec![vec![1, 2], vec![], vec![9]])), Ok(Some(9)));
        assert_eq!(
            rt.run_sync(feed(&Sink::take(3).collect_leftover(), vec![vec![1, 2], vec![3, 4]])),
            Ok((Chunk::from_vec(vec![1, 2, 3]), Chunk::from_vec(vec![4])))
        );
        assert_eq!(
            rt.run_sync(feed(&Sink::collect_all(), vec![vec![1], vec![2, 3]])),
            Ok(Chunk::from_vec(vec![1, 2, 3]))
        );
    }

    #[test]
    fn test_map_and_for_each() {
        let rt = runtime();
        let doubled = Sink::<i32, i32, String>::sum().map(|n| n * 2);
        assert_eq!(rt.run_sync(feed(&doubled, vec![vec![1, 2, 3]])), Ok(12));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let sink = Sink::for_each(move |n: i32| {
            let s = Arc::clone(&s);
            Effect::<(), String>::sync(move || s.lock().push(n))
        });
        rt.run_sync(feed(&sink, vec![vec![1, 2], vec![3]])).unwrap();
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }
}
