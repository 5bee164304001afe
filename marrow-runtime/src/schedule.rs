//! # Schedules
//!
//! A [`Schedule<In, Out>`] is a recurrence policy. Each time `repeat` or
//! `retry` finishes an attempt it feeds the attempt's value (or error) to
//! the schedule's driver, which answers with a [`Decision`]: go again after
//! a delay, or stop. Both answers carry an output.
//!
//! ## Design
//!
//! - A schedule is a factory; every run of `repeat`/`retry` gets a fresh
//!   driver, so the same effect can be run many times
//! - Drivers are purely decisional; the delay is slept by the effect that
//!   consults them
//! - Combinators wrap drivers: `union` continues while either side does,
//!   `intersect` while both do, `and_then` runs one policy after another
//!
//! ## Example
//!
//! ```rust,ignore
//! use marrow_runtime::Schedule;
//! use std::time::Duration;
//!
//! // Up to five retries, backing off exponentially from 10ms.
//! let policy = Schedule::exponential(Duration::from_millis(10), 2.0)
//!     .intersect(Schedule::recurs(5));
//! let resilient = flaky_request.retry(policy);
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::cause::Cause;
use crate::effect::Effect;

/// What a schedule decided after one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision<Out> {
    /// Run again after `delay`.
    Continue {
        /// Time to wait before the next attempt.
        delay: Duration,
        /// Output for this step.
        output: Out,
    },
    /// Stop recurring.
    Done {
        /// Final output.
        output: Out,
    },
}

impl<Out> Decision<Out> {
    /// Returns true if the schedule stopped.
    pub fn is_done(&self) -> bool {
        matches!(self, Decision::Done { .. })
    }

    /// The delay before the next attempt, if any.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Decision::Continue { delay, .. } => Some(*delay),
            Decision::Done { .. } => None,
        }
    }

    /// The step's output.
    pub fn output(&self) -> &Out {
        match self {
            Decision::Continue { output, .. } | Decision::Done { output } => output,
        }
    }

    /// Consume the decision, keeping the output.
    pub fn into_output(self) -> Out {
        match self {
            Decision::Continue { output, .. } | Decision::Done { output } => output,
        }
    }

    /// Transform the output.
    pub fn map<Out2>(self, f: impl FnOnce(Out) -> Out2) -> Decision<Out2> {
        match self {
            Decision::Continue { delay, output } => Decision::Continue {
                delay,
                output: f(output),
            },
            Decision::Done { output } => Decision::Done { output: f(output) },
        }
    }
}

/// The per-run state of a schedule.
pub struct ScheduleDriver<In, Out> {
    step: Box<dyn FnMut(&In) -> Decision<Out> + Send>,
}

impl<In, Out> ScheduleDriver<In, Out> {
    /// Feed one input and get the decision.
    pub fn next(&mut self, input: &In) -> Decision<Out> {
        (self.step)(input)
    }
}

impl<In, Out> fmt::Debug for ScheduleDriver<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleDriver").finish_non_exhaustive()
    }
}

/// A recurrence policy consuming `In` and producing `Out`.
pub struct Schedule<In, Out> {
    make: Arc<dyn Fn() -> ScheduleDriver<In, Out> + Send + Sync>,
}

impl<In, Out> Clone for Schedule<In, Out> {
    fn clone(&self) -> Self {
        Self {
            make: Arc::clone(&self.make),
        }
    }
}

impl<In, Out> fmt::Debug for Schedule<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schedule").finish_non_exhaustive()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl<In: 'static, Out: 'static> Schedule<In, Out> {
    /// Build a schedule from a factory of step functions.
    pub fn from_fn<M, S>(make: M) -> Self
    where
        M: Fn() -> S + Send + Sync + 'static,
        S: FnMut(&In) -> Decision<Out> + Send + 'static,
    {
        Self {
            make: Arc::new(move || ScheduleDriver {
                step: Box::new(make()),
            }),
        }
    }

    /// A fresh driver.
    pub fn driver(&self) -> ScheduleDriver<In, Out> {
        (self.make)()
    }
}

impl<In: 'static> Schedule<In, usize> {
    /// Recur `n` times without delay. Outputs the number of recurrences so
    /// far; the final output is `n`.
    pub fn recurs(n: usize) -> Self {
        Self::from_fn(move || {
            let mut count = 0usize;
            move |_: &In| {
                if count < n {
                    count += 1;
                    Decision::Continue {
                        delay: Duration::ZERO,
                        output: count - 1,
                    }
                } else {
                    Decision::Done { output: n }
                }
            }
        })
    }

    /// Recur exactly once.
    pub fn once() -> Self {
        Self::recurs(1)
    }

    /// Recur forever without delay, counting recurrences.
    pub fn forever() -> Self {
        Self::spaced(Duration::ZERO)
    }

    /// Recur forever, waiting `interval` between attempts.
    pub fn spaced(interval: Duration) -> Self {
        Self::from_fn(move || {
            let mut count = 0usize;
            move |_: &In| {
                let output = count;
                count = count.saturating_add(1);
                Decision::Continue {
                    delay: interval,
                    output,
                }
            }
        })
    }

    /// Recur forever on a fixed grid of `interval`, measured from the first
    /// decision. An attempt that overruns skips the missed slots instead of
    /// piling up.
    pub fn fixed(interval: Duration) -> Self {
        Self::from_fn(move || {
            let mut start: Option<Instant> = None;
            let mut count = 0usize;
            move |_: &In| {
                let origin = *start.get_or_insert_with(Instant::now);
                let period = interval.as_nanos();
                let delay = if period == 0 {
                    Duration::ZERO
                } else {
                    let elapsed = origin.elapsed().as_nanos();
                    let next = (elapsed / period + 1) * period;
                    Duration::from_nanos(u64::try_from(next - elapsed).unwrap_or(u64::MAX))
                };
                let output = count;
                count = count.saturating_add(1);
                Decision::Continue { delay, output }
            }
        })
    }
}

impl<In: 'static> Schedule<In, Duration> {
    /// Delays `base * factor^n` for the n-th recurrence. Outputs the delay.
    pub fn exponential(base: Duration, factor: f64) -> Self {
        Self::from_fn(move || {
            let mut attempt = 0i32;
            move |_: &In| {
                let nanos = base.as_nanos() as f64 * factor.powi(attempt);
                attempt = attempt.saturating_add(1);
                let delay = if nanos.is_finite() && nanos < u64::MAX as f64 {
                    Duration::from_nanos(nanos.round() as u64)
                } else {
                    Duration::MAX
                };
                Decision::Continue {
                    delay,
                    output: delay,
                }
            }
        })
    }

    /// Delays following the Fibonacci sequence starting at `one, one`.
    /// Outputs the delay.
    pub fn fibonacci(one: Duration) -> Self {
        Self::from_fn(move || {
            let (mut current, mut next) = (one, one);
            move |_: &In| {
                let delay = current;
                let following = current.saturating_add(next);
                current = next;
                next = following;
                Decision::Continue {
                    delay,
                    output: delay,
                }
            }
        })
    }
}

impl<In: Clone + 'static> Schedule<In, In> {
    /// Recur forever, outputting each input.
    pub fn identity() -> Self {
        Self::from_fn(|| {
            |input: &In| Decision::Continue {
                delay: Duration::ZERO,
                output: input.clone(),
            }
        })
    }

    /// Recur while `pred` holds for the input.
    pub fn recur_while<P>(pred: P) -> Self
    where
        P: Fn(&In) -> bool + Send + Sync + 'static,
    {
        let pred = Arc::new(pred);
        Self::from_fn(move || {
            let pred = Arc::clone(&pred);
            move |input: &In| {
                if pred(input) {
                    Decision::Continue {
                        delay: Duration::ZERO,
                        output: input.clone(),
                    }
                } else {
                    Decision::Done {
                        output: input.clone(),
                    }
                }
            }
        })
    }

    /// Recur until `pred` holds for the input.
    pub fn recur_until<P>(pred: P) -> Self
    where
        P: Fn(&In) -> bool + Send + Sync + 'static,
    {
        Self::recur_while(move |input| !pred(input))
    }
}

// ============================================================================
// Combinators
// ============================================================================

impl<In: 'static, Out: 'static> Schedule<In, Out> {
    /// Continue while either schedule continues, waiting the shorter delay.
    pub fn union<Out2: 'static>(self, other: Schedule<In, Out2>) -> Schedule<In, (Out, Out2)> {
        Schedule::from_fn(move || {
            let mut left = self.driver();
            let mut right = other.driver();
            move |input: &In| {
                let (l, r) = (left.next(input), right.next(input));
                let delay = match (l.delay(), r.delay()) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (Some(a), None) | (None, Some(a)) => Some(a),
                    (None, None) => None,
                };
                let output = (l.into_output(), r.into_output());
                match delay {
                    Some(delay) => Decision::Continue { delay, output },
                    None => Decision::Done { output },
                }
            }
        })
    }

    /// Continue while both schedules continue, waiting the longer delay.
    pub fn intersect<Out2: 'static>(self, other: Schedule<In, Out2>) -> Schedule<In, (Out, Out2)> {
        Schedule::from_fn(move || {
            let mut left = self.driver();
            let mut right = other.driver();
            move |input: &In| {
                let (l, r) = (left.next(input), right.next(input));
                let delay = match (l.delay(), r.delay()) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    _ => None,
                };
                let output = (l.into_output(), r.into_output());
                match delay {
                    Some(delay) => Decision::Continue { delay, output },
                    None => Decision::Done { output },
                }
            }
        })
    }

    /// Run `self` until it is done, then `other`. The input that ended
    /// `self` is the first input `other` sees.
    pub fn and_then(self, other: Schedule<In, Out>) -> Self {
        Schedule::from_fn(move || {
            let mut first = Some(self.driver());
            let mut second = other.driver();
            move |input: &In| {
                if let Some(driver) = first.as_mut() {
                    let decision = driver.next(input);
                    if !decision.is_done() {
                        return decision;
                    }
                    first = None;
                }
                second.next(input)
            }
        })
    }

    /// Stop as soon as `pred` fails for an output.
    pub fn while_output<P>(self, pred: P) -> Self
    where
        P: Fn(&Out) -> bool + Send + Sync + 'static,
    {
        let pred = Arc::new(pred);
        Schedule::from_fn(move || {
            let mut driver = self.driver();
            let pred = Arc::clone(&pred);
            move |input: &In| match driver.next(input) {
                Decision::Continue { delay, output } if pred(&output) => {
                    Decision::Continue { delay, output }
                }
                decision => Decision::Done {
                    output: decision.into_output(),
                },
            }
        })
    }

    /// Stop as soon as `pred` holds for an output.
    pub fn until_output<P>(self, pred: P) -> Self
    where
        P: Fn(&Out) -> bool + Send + Sync + 'static,
    {
        self.while_output(move |output| !pred(output))
    }

    /// Observe every output.
    pub fn tap_output<F>(self, f: F) -> Self
    where
        F: Fn(&Out) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Schedule::from_fn(move || {
            let mut driver = self.driver();
            let f = Arc::clone(&f);
            move |input: &In| {
                let decision = driver.next(input);
                f(decision.output());
                decision
            }
        })
    }

    /// Transform every output.
    pub fn map<Out2, F>(self, f: F) -> Schedule<In, Out2>
    where
        Out2: 'static,
        F: Fn(Out) -> Out2 + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Schedule::from_fn(move || {
            let mut driver = self.driver();
            let f = Arc::clone(&f);
            move |input: &In| driver.next(input).map(|output| f(output))
        })
    }

    /// Replace the output with the number of recurrences so far.
    pub fn repetitions(self) -> Schedule<In, usize> {
        Schedule::from_fn(move || {
            let mut driver = self.driver();
            let mut count = 0usize;
            move |input: &In| match driver.next(input) {
                Decision::Continue { delay, .. } => {
                    count += 1;
                    Decision::Continue {
                        delay,
                        output: count,
                    }
                }
                Decision::Done { .. } => Decision::Done { output: count },
            }
        })
    }
}

// ============================================================================
// Repeat and retry
// ============================================================================

type SharedDriver<In, Out> = Arc<Mutex<ScheduleDriver<In, Out>>>;

fn repeat_loop<A, E, Out>(effect: Effect<A, E>, driver: SharedDriver<A, Out>) -> Effect<Out, E>
where
    A: Send + 'static,
    E: Send + 'static,
    Out: Send + 'static,
{
    let again = effect.clone();
    effect.flat_map(move |a| {
        let decision = driver.lock().next(&a);
        match decision {
            Decision::Continue { delay, .. } => Effect::<(), E>::sleep(delay)
                .zip_right(repeat_loop(again.clone(), Arc::clone(&driver))),
            Decision::Done { output } => Effect::ready(output),
        }
    })
}

fn retry_loop<A, E, E2, Out, F>(
    effect: Effect<A, E>,
    driver: SharedDriver<E, Out>,
    exhausted: Arc<F>,
) -> Effect<A, E2>
where
    A: Send + 'static,
    E: Send + 'static,
    E2: Send + 'static,
    Out: Send + 'static,
    F: Fn(E, Out) -> Effect<A, E2> + Send + Sync + 'static,
{
    let again = effect.clone();
    effect.catch_all(move |e| {
        let decision = driver.lock().next(&e);
        match decision {
            Decision::Continue { delay, .. } => Effect::<(), E2>::sleep(delay).zip_right(
                retry_loop(again.clone(), Arc::clone(&driver), Arc::clone(&exhausted)),
            ),
            Decision::Done { output } => exhausted(e, output),
        }
    })
}

impl<A, E> Effect<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    /// Run again after every success until `schedule` is done. Succeeds with
    /// the schedule's final output; the first failure stops the loop.
    pub fn repeat<Out: Send + 'static>(self, schedule: Schedule<A, Out>) -> Effect<Out, E> {
        Effect::suspend(move || {
            let driver = Arc::new(Mutex::new(schedule.driver()));
            repeat_loop(self.clone(), driver)
        })
    }

    /// Run `n + 1` times in total and keep the last value.
    pub fn repeat_n(self, n: usize) -> Self
    where
        A: Clone,
    {
        self.repeat(
            Schedule::recurs(n)
                .intersect(Schedule::identity())
                .map(|(_, last)| last),
        )
    }

    /// Run again while `pred` holds for the value; keep the last value.
    pub fn repeat_while<P>(self, pred: P) -> Self
    where
        A: Clone,
        P: Fn(&A) -> bool + Send + Sync + 'static,
    {
        self.repeat(Schedule::recur_while(pred))
    }

    /// Run again until `pred` holds for the value; keep the last value.
    pub fn repeat_until<P>(self, pred: P) -> Self
    where
        A: Clone,
        P: Fn(&A) -> bool + Send + Sync + 'static,
    {
        self.repeat(Schedule::recur_until(pred))
    }

    /// Run again after every typed failure until `schedule` is done, then
    /// fail with the last error. Defects and interruptions are not retried.
    pub fn retry<Out: Send + 'static>(self, schedule: Schedule<E, Out>) -> Self {
        self.retry_or_else(schedule, |e, _| Effect::ready_cause(Cause::Fail(e)))
    }

    /// [`retry`](Self::retry), running `fallback` with the last error and
    /// the schedule's final output once the schedule is done.
    pub fn retry_or_else<Out, E2, F>(self, schedule: Schedule<E, Out>, fallback: F) -> Effect<A, E2>
    where
        Out: Send + 'static,
        E2: Send + 'static,
        F: Fn(E, Out) -> Effect<A, E2> + Send + Sync + 'static,
    {
        let fallback = Arc::new(fallback);
        Effect::suspend(move || {
            let driver = Arc::new(Mutex::new(schedule.driver()));
            retry_loop(self.clone(), driver, Arc::clone(&fallback))
        })
    }

    /// Retry up to `n` times.
    pub fn retry_n(self, n: usize) -> Self {
        self.retry(Schedule::recurs(n))
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
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Eff<A> = Effect<A, String>;

    fn runtime() -> Runtime {
        Runtime::new(
            RuntimeConfig::builder()
                .num_workers(2)
                .thread_name_prefix("schedule-test")
                .build()
                .unwrap(),
        )
        .unwrap()
    }

    fn counting(counter: &Arc<AtomicUsize>) -> Eff<usize> {
        let counter = Arc::clone(counter);
        Eff::sync(move || counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn fail_until(counter: &Arc<AtomicUsize>, successes_after: usize) -> Eff<usize> {
        let counter = Arc::clone(counter);
        Eff::try_sync(move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > successes_after {
                Ok(attempt)
            } else {
                Err(format!("attempt {} failed", attempt))
            }
        })
    }

    fn decisions<Out>(schedule: &Schedule<(), Out>, steps: usize) -> Vec<Decision<Out>>
    where
        Out: 'static,
    {
        let mut driver = schedule.driver();
        (0..steps).map(|_| driver.next(&())).collect()
    }

    #[test]
    fn test_recurs() {
        let d = decisions(&Schedule::recurs(2), 4);
        assert!(!d[0].is_done());
        assert!(!d[1].is_done());
        assert_eq!(d[2], Decision::Done { output: 2 });
        assert_eq!(d[3], Decision::Done { output: 2 });
        assert!(decisions(&Schedule::once(), 2)[1].is_done());
    }

    #[test]
    fn test_spaced_and_forever() {
        let d = decisions(&Schedule::spaced(Duration::from_millis(5)), 3);
        assert!(d.iter().all(|d| d.delay() == Some(Duration::from_millis(5))));
        assert_eq!(d[2].output(), &2);
        assert_eq!(decisions(&Schedule::forever(), 1)[0].delay(), Some(Duration::ZERO));
    }

    #[test]
    fn test_fixed_aligns_to_grid() {
        let interval = Duration::from_millis(50);
        let mut driver = Schedule::<(), usize>::fixed(interval).driver();
        let first = driver.next(&()).delay().unwrap();
        assert!(first <= interval && first > Duration::from_millis(40));
        std::thread::sleep(Duration::from_millis(120));
        let later = driver.next(&()).delay().unwrap();
        assert!(later <= interval);
    }

    #[test]
    fn test_exponential() {
        let d = decisions(&Schedule::exponential(Duration::from_millis(10), 2.0), 4);
        let delays: Vec<_> = d.iter().map(|d| d.delay().unwrap()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(80)
            ]
        );
        let huge = decisions(&Schedule::exponential(Duration::from_secs(1), 1e300), 3);
        assert_eq!(huge[2].delay(), Some(Duration::MAX));
    }

    #[test]
    fn test_fibonacci() {
        let d = decisions(&Schedule::fibonacci(Duration::from_millis(1)), 6);
        let millis: Vec<u128> = d.iter().map(|d| d.delay().unwrap().as_millis()).collect();
        assert_eq!(millis, vec![1, 1, 2, 3, 5, 8]);
    }

    #[test]
    fn test_recur_while_and_until() {
        let mut driver = Schedule::recur_while(|n: &i32| *n < 3).driver();
        assert!(!driver.next(&1).is_done());
        assert_eq!(driver.next(&3), Decision::Done { output: 3 });

        let mut driver = Schedule::recur_until(|n: &i32| *n == 0).driver();
        assert!(!driver.next(&5).is_done());
        assert!(driver.next(&0).is_done());
    }

    #[test]
    fn test_union_and_intersect() {
        let short = Schedule::<(), usize>::recurs(1);
        let long = Schedule::<(), usize>::spaced(Duration::from_millis(7)).while_output(|n| *n < 3);

        let union = decisions(&short.clone().union(long.clone()), 4);
        assert_eq!(union[0].delay(), Some(Duration::ZERO));
        assert_eq!(union[1].delay(), Some(Duration::from_millis(7)));
        assert!(union[3].is_done());

        let intersect = decisions(&short.intersect(long), 2);
        assert_eq!(intersect[0].delay(), Some(Duration::from_millis(7)));
        assert!(intersect[1].is_done());
    }

    #[test]
    fn test_and_then() {
        let schedule = Schedule::<(), usize>::recurs(1).and_then(Schedule::spaced(Duration::from_millis(3)));
        let d = decisions(&schedule, 3);
        assert_eq!(d[0].delay(), Some(Duration::ZERO));
        assert_eq!(d[1].delay(), Some(Duration::from_millis(3)));
        assert_eq!(d[1].output(), &0);
        assert_eq!(d[2].output(), &1);
    }

    #[test]
    fn test_output_combinators() {
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        let schedule = Schedule::<(), usize>::forever()
            .until_output(|n| *n >= 2)
            .tap_output(move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            })
            .map(|n| n * 10);
        let d = decisions(&schedule, 3);
        assert_eq!(d[2], Decision::Done { output: 20 });
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        let reps = decisions(&Schedule::<(), usize>::recurs(2).repetitions(), 3);
        assert_eq!(reps[2], Decision::Done { output: 2 });
    }

    #[test]
    fn test_repeat_runs_n_plus_one() {
        let rt = runtime();
        let counter = Arc::new(AtomicUsize::new(0));
        let result = rt.run_sync(counting(&counter).repeat(Schedule::recurs(3)));
        assert_eq!(result, Ok(3));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_repeat_n_keeps_last_value() {
        let rt = runtime();
        let counter = Arc::new(AtomicUsize::new(0));
        assert_eq!(rt.run_sync(counting(&counter).repeat_n(4)), Ok(5));
    }

    #[test]
    fn test_repeat_while() {
        let rt = runtime();
        let counter = Arc::new(AtomicUsize::new(0));
        assert_eq!(rt.run_sync(counting(&counter).repeat_while(|n| *n < 7)), Ok(7));
    }

    #[test]
    fn test_repeat_is_rerunnable() {
        let rt = runtime();
        let counter = Arc::new(AtomicUsize::new(0));
        let effect = counting(&counter).repeat(Schedule::recurs(1));
        rt.run_sync(effect.clone()).unwrap();
        rt.run_sync(effect).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_repeat_with_delay() {
        let rt = runtime();
        let counter = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();
        let effect = counting(&counter).repeat(Schedule::spaced(Duration::from_millis(5)).intersect(Schedule::recurs(2)));
        rt.run_blocking(effect).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_succeeds_after_failures() {
        let rt = runtime();
        let counter = Arc::new(AtomicUsize::new(0));
        let result = rt.run_sync(fail_until(&counter, 3).retry(Schedule::recurs(3)));
        assert_eq!(result, Ok(4));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_retry_exhausted_returns_last_error() {
        let rt = runtime();
        let counter = Arc::new(AtomicUsize::new(0));
        let result = rt.run_sync(fail_until(&counter, usize::MAX).retry_n(2));
        assert_eq!(result, Err(RunError::Failure("attempt 3 failed".into())));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_does_not_retry_defects() {
        let rt = runtime();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let effect = Eff::<i32>::sync(move || {
            c.fetch_add(1, Ordering::SeqCst);
            panic!("broken")
        })
        .retry_n(5);
        assert!(rt.run_sync(effect).unwrap_err().is_defect());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_or_else() {
        let rt = runtime();
        let counter = Arc::new(AtomicUsize::new(0));
        let effect = fail_until(&counter, usize::MAX).retry_or_else(Schedule::recurs(1), |e, n| {
            Effect::<usize, ()>::succeed(e.len() + n)
        });
        assert_eq!(rt.run_sync(effect), Ok("attempt 2 failed".len() + 1));
    }

    #[test]
    fn test_retry_with_saturated_backoff_waits() {
        let rt = runtime();
        let counter = Arc::new(AtomicUsize::new(0));
        let effect = fail_until(&counter, usize::MAX)
            .retry(Schedule::exponential(Duration::MAX, 2.0))
            .timeout(Duration::from_millis(20));
        assert_eq!(rt.run_blocking(effect), Ok(None));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
