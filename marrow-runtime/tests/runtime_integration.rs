//! End-to-end scenarios against the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use marrow_runtime::{
    Chunk, Concurrency, Effect, Exit, FiberScope, Queue, Ref, RunError, Runtime, RuntimeConfig,
    Schedule, Sink, Stream, SynchronizedRef,
};

fn runtime() -> Runtime {
    Runtime::new(
        RuntimeConfig::builder()
            .num_workers(4)
            .thread_name_prefix("integration")
            .build()
            .expect("valid config"),
    )
    .expect("runtime starts")
}

#[derive(Debug, Clone, PartialEq)]
struct Todo {
    id: u32,
    title: String,
    done: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum TodoError {
    NotFound(u32),
}

#[test]
fn todo_list_with_ref() {
    let rt = runtime();
    let todos: Ref<Vec<Todo>> = Ref::new(Vec::new());

    let add = |todos: &Ref<Vec<Todo>>, id: u32, title: &str| {
        let todo = Todo {
            id,
            title: title.to_string(),
            done: false,
        };
        todos.update::<TodoError, _>(move |mut list| {
            list.push(todo.clone());
            list
        })
    };
    let complete = |todos: &Ref<Vec<Todo>>, id: u32| {
        todos
            .modify::<bool, TodoError, _>(move |mut list| {
                let found = list.iter_mut().find(|t| t.id == id).map(|t| t.done = true);
                (found.is_some(), list)
            })
            .flat_map(move |found| {
                if found {
                    Effect::unit()
                } else {
                    Effect::fail(TodoError::NotFound(id))
                }
            })
    };

    let program = add(&todos, 1, "write tests")
        .zip_right(add(&todos, 2, "ship"))
        .zip_right(complete(&todos, 1))
        .zip_right(todos.get());
    let list = rt.run_blocking(program).unwrap();
    assert_eq!(list.len(), 2);
    assert!(list[0].done);
    assert!(!list[1].done);

    let missing = rt.run_blocking(complete(&todos, 9));
    assert_eq!(missing, Err(RunError::Failure(TodoError::NotFound(9))));
}

#[test]
fn retry_with_backoff_then_recover() {
    let rt = runtime();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let flaky = Effect::<&str, String>::try_sync(move || {
        match counter.fetch_add(1, Ordering::SeqCst) {
            0 | 1 => Err("connection refused".to_string()),
            _ => Ok("connected"),
        }
    })
    .tap_error(|e| Effect::<(), String>::log_warn(format!("attempt failed: {}", e)));

    let schedule = Schedule::exponential(Duration::from_millis(1), 2.0)
        .intersect(Schedule::recurs(5))
        .map(|(delay, _)| delay);
    let started = Instant::now();
    assert_eq!(rt.run_blocking(flaky.retry(schedule)), Ok("connected"));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() >= Duration::from_millis(3));

    let hopeless = Effect::<u8, String>::fail("down".into())
        .retry_or_else(Schedule::recurs(2), |e, tries| {
            Effect::<u8, String>::succeed(0).map(move |_| (e.len() + tries) as u8)
        });
    assert_eq!(rt.run_blocking(hopeless), Ok(6));
}

#[test]
fn services_flow_to_forked_fibers() {
    #[derive(Debug, Clone)]
    struct Greeting(&'static str);

    let rt = runtime();
    let greet = Effect::<Greeting, String>::service().map(|g| format!("{}, world", g.0));
    let program = greet
        .fork::<String>()
        .flat_map(|fiber| fiber.join())
        .provide_service(Greeting("hello"));
    assert_eq!(rt.run_blocking(program), Ok("hello, world".to_string()));

    let missing = Effect::<Greeting, String>::service();
    assert!(rt.run_blocking(missing).unwrap_err().is_defect());
}

#[test]
fn producer_consumer_over_queue() {
    let rt = runtime();
    let queue = Queue::<u32>::bounded(4);
    let producer = {
        let offers = queue.clone();
        Effect::<bool, String>::for_each(
            1..=20,
            move |n| offers.offer::<String>(n),
            Concurrency::Sequential,
        )
        .zip_right(queue.shutdown())
    };
    let consumer = {
        let sum = Ref::new(0u32);
        let take = {
            let (queue, sum) = (queue.clone(), sum.clone());
            queue.take::<String>().flat_map(move |next| match next {
                Some(n) => sum.update(move |s| s + n).as_value(true),
                None => Effect::succeed(false),
            })
        };
        take.repeat_while(|more| *more).zip_right(sum.get())
    };
    let result = rt.run_blocking(producer.zip_par(consumer).map(|(_, total)| total));
    assert_eq!(result, Ok(210));
    assert!(queue.is_shutdown());
}

#[test]
fn scope_interrupts_unfinished_work() {
    let rt = runtime();
    let stopped = Arc::new(AtomicUsize::new(0));
    let s = Arc::clone(&stopped);
    let program = FiberScope::scoped(move |scope| {
        let s = Arc::clone(&s);
        let worker = Effect::<(), String>::never().on_exit(move |exit: &Exit<(), String>| {
            let s = Arc::clone(&s);
            let interrupted = exit.is_interrupted();
            Effect::sync(move || {
                if interrupted {
                    s.fetch_add(1, Ordering::SeqCst);
                }
            })
        });
        Effect::all(
            (0..3).map(move |_| worker.clone().fork_in::<String>(&scope)),
            Concurrency::Sequential,
        )
        .zip_right(Effect::sleep(Duration::from_millis(20)))
    });
    rt.run_blocking(program).unwrap();
    assert_eq!(stopped.load(Ordering::SeqCst), 3);
}

#[test]
fn timeout_and_race() {
    let rt = runtime();
    let slow = Effect::<&str, String>::succeed("slow").delay(Duration::from_millis(500));
    let fast = Effect::<&str, String>::succeed("fast").delay(Duration::from_millis(5));

    assert_eq!(rt.run_blocking(slow.clone().race(fast.clone())), Ok("fast"));
    assert_eq!(rt.run_blocking(slow.timeout(Duration::from_millis(10))), Ok(None));
    assert_eq!(rt.run_blocking(fast.timeout(Duration::from_millis(500))), Ok(Some("fast")));
}

#[test]
fn concurrent_updates_are_serialized() {
    let rt = runtime();
    let counter = SynchronizedRef::new(10i64);
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let updates = (0..25).map(|i| {
        let (inside, peak) = (Arc::clone(&inside), Arc::clone(&peak));
        counter.update_effect(move |n| {
            let (entering, peak) = (Arc::clone(&inside), Arc::clone(&peak));
            Effect::<(), String>::sync(move || {
                let now = entering.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
            })
            .zip_right(Effect::sleep(Duration::from_millis(1)))
            .zip_right(Effect::log_debug(format!("update {}", i)))
            .zip_right(Effect::sync({
                let inside = Arc::clone(&inside);
                move || {
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            }))
            .as_value(n + 1)
        })
    });
    let program = Effect::all(updates, Concurrency::Unbounded).zip_right(counter.get());
    assert_eq!(rt.run_blocking(program), Ok(35));
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[test]
fn stream_pipeline_end_to_end() {
    let rt = runtime();
    let words = Stream::<&str, String>::make(vec!["effect", "fiber", "stream", "sink", "schedule"]);
    let lengths = words
        .clone()
        .filter(|w| w.starts_with('s'))
        .map(|w| w.len())
        .run(Sink::sum());
    assert_eq!(rt.run_blocking(lengths), Ok(6 + 4 + 8));

    let numbered = Stream::<i64, String>::range(1, 3)
        .concat(Stream::range(10, 11))
        .map_effect(|n| Effect::succeed(n * n));
    assert_eq!(
        rt.run_blocking(numbered.run_collect()),
        Ok(Chunk::from_vec(vec![1, 4, 9, 100, 121]))
    );

    let first_two = words.run(Sink::take(2).collect_leftover());
    assert_eq!(
        rt.run_blocking(first_two),
        Ok((
            Chunk::from_vec(vec!["effect", "fiber"]),
            Chunk::from_vec(vec!["stream", "sink", "schedule"])
        ))
    );
}

#[test]
fn run_sync_reports_async_boundary() {
    let rt = runtime();
    let sleepy = Effect::<(), String>::sleep(Duration::from_millis(10));
    assert!(matches!(rt.run_sync(sleepy), Err(RunError::AsyncBoundary(_))));
}

#[test]
fn run_handle_interrupt() {
    let rt = runtime();
    let handle = rt.run_async(Effect::<(), String>::never());
    assert!(!handle.is_done());
    handle.interrupt();
    assert!(handle.wait().unwrap_err().is_interrupted());
}
