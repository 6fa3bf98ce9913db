use super::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Simple shared integer counter
fn shared_counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Gate the test thread opens to let blocked handlers continue.
fn release_gate() -> Arc<(Mutex<bool>, Condvar)> {
    Arc::new((Mutex::new(false), Condvar::new()))
}

fn open(gate: &(Mutex<bool>, Condvar)) {
    *gate.0.lock().unwrap() = true;
    gate.1.notify_all();
}

fn block_on(gate: &(Mutex<bool>, Condvar)) {
    let _open = gate.1.wait_while(gate.0.lock().unwrap(), |open| !*open).unwrap();
}

//
// 1. Lifecycle
//
#[test]
fn test_start_only_once() {
    let pool = WorkerPool::new("once", FiniteSource::from_iter(0..4), 2, |_, _| Ok(()));
    pool.start().unwrap();
    assert!(matches!(pool.start(), Err(PoolError::AlreadyStarted)));
    pool.join();
}

#[test]
fn test_every_item_processed_once() {
    let sum = shared_counter();
    let s = sum.clone();
    let pool = WorkerPool::new("sum", FiniteSource::from_iter(0..20usize), 4, move |n, _| {
        s.fetch_add(n, Ordering::SeqCst);
        Ok(())
    });

    pool.start().unwrap();
    pool.join();

    assert_eq!(sum.load(Ordering::SeqCst), 190);
    assert!(pool.all_finished());
    for id in 0..pool.worker_count() {
        assert!(pool.is_finished(id).unwrap());
        assert_eq!(pool.outcome(id).unwrap(), Some(WorkerOutcome::Exhausted));
    }
}

#[test]
fn test_worker_count_clamped_to_bounded_source() {
    let pool = WorkerPool::new("clamp", FiniteSource::from_iter(["a", "b"]), 8, |_, _| Ok(()));
    assert_eq!(pool.worker_count(), 2);

    let unbounded = WorkerPool::new("unbounded", TaskQueue::<u8>::new(), 8, |_, _| Ok(()));
    assert_eq!(unbounded.worker_count(), 8);
}

#[test]
fn test_empty_source_finishes_on_start() {
    let finished = shared_counter();
    let pool = WorkerPool::new("empty", FiniteSource::<u8>::from_iter([]), 4, |_, _| Ok(()));
    let f = finished.clone();
    pool.on(PoolEvent::Finished, move |_| {
        f.fetch_add(1, Ordering::SeqCst);
    });

    assert!(!pool.all_finished());
    pool.start().unwrap();
    assert!(pool.all_finished());
    assert!(pool.wait(Some(Duration::ZERO)));
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}

#[test]
fn test_all_finished_becomes_true_exactly_once() {
    let gate = release_gate();
    let finished = shared_counter();

    let g = gate.clone();
    let pool = WorkerPool::new("finish", FiniteSource::from_iter(0..6), 3, move |_, _| {
        block_on(&g);
        Ok(())
    });
    let f = finished.clone();
    pool.on(PoolEvent::Finished, move |_| {
        f.fetch_add(1, Ordering::SeqCst);
    });

    assert!(!pool.all_finished());
    pool.start().unwrap();
    assert!(!pool.all_finished());
    assert!(!pool.wait(Some(Duration::from_millis(50))));

    open(&gate);
    assert!(pool.wait(Some(Duration::from_secs(5))));
    pool.join();

    assert!(pool.all_finished());
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}

//
// 2. Parallelism
//
#[test]
fn test_parallelism_bounded_by_worker_count() {
    let pool = WorkerPool::new("sleepers", FiniteSource::from_iter(0..10), 4, |_, _| {
        thread::sleep(Duration::from_millis(200));
        Ok(())
    });

    let started = Instant::now();
    pool.start().unwrap();
    pool.join();
    let elapsed = started.elapsed();

    // three rounds of four, not ten sequential sleeps
    assert!(elapsed >= Duration::from_millis(550), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "{elapsed:?}");
}

//
// 3. Pause / resume
//
#[test]
fn test_paused_workers_do_not_dequeue() {
    let processed = shared_counter();
    let p = processed.clone();
    let executor = TaskExecutor::new("pausable", 1, move |_: u32, _| {
        p.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    executor.start().unwrap();

    executor.pool().pause();
    executor.pool().pause();
    for i in 0..3 {
        executor.submit(i);
    }
    thread::sleep(Duration::from_millis(100));
    assert_eq!(processed.load(Ordering::SeqCst), 0);
    assert_eq!(executor.pending(), 3);

    // one resume undoes any number of pauses
    executor.pool().resume();
    assert!(wait_until(Duration::from_secs(5), || processed
        .load(Ordering::SeqCst)
        == 3));

    executor.cancel();
    executor.join();
}

//
// 4. Task executor
//
#[test]
fn test_clear_discards_unclaimed_items() {
    let processed = Arc::new(Mutex::new(Vec::new()));
    let p = processed.clone();
    let executor = TaskExecutor::new("clearable", 2, move |item: &'static str, _| {
        p.lock().unwrap().push(item);
        Ok(())
    });

    for _ in 0..5 {
        executor.submit("discarded");
    }
    assert_eq!(executor.clear(), 5);
    assert_eq!(executor.pending(), 0);

    executor.start().unwrap();
    executor.submit("marker");
    assert!(wait_until(Duration::from_secs(5), || !processed
        .lock()
        .unwrap()
        .is_empty()));

    executor.cancel();
    executor.join();
    assert_eq!(*processed.lock().unwrap(), vec!["marker"]);
}

#[test]
fn test_cancel_releases_idle_workers() {
    let executor = TaskExecutor::new("idle", 3, |_: u8, _| Ok(()));
    executor.start().unwrap();
    thread::sleep(Duration::from_millis(50));

    executor.cancel();
    executor.cancel();
    executor.join();

    let pool = executor.pool();
    assert!(pool.all_cancelled());
    assert!(pool.all_finished());
    for id in 0..pool.worker_count() {
        assert!(pool.is_cancelled(id).unwrap());
        assert_eq!(pool.outcome(id).unwrap(), Some(WorkerOutcome::Cancelled));
    }
}

#[test]
fn test_cancel_wakes_handler_blocked_on_its_own_condition() {
    let started = shared_counter();
    let s = started.clone();
    let executor = TaskExecutor::new("blocked", 2, move |_: u8, probe| {
        let wake = release_gate();
        let w = wake.clone();
        probe.on_cancel(move || open(&w));
        s.fetch_add(1, Ordering::SeqCst);
        block_on(&wake);
        Ok(())
    });
    executor.start().unwrap();
    executor.submit(1);
    executor.submit(2);
    executor.submit(3);
    assert!(wait_until(Duration::from_secs(5), || started
        .load(Ordering::SeqCst)
        == 2));

    executor.cancel();
    executor.join();

    assert_eq!(started.load(Ordering::SeqCst), 2);
    assert!(executor.pool().all_finished());
}

#[test]
fn test_cancel_listener_runs_once() {
    let fired = shared_counter();
    let entered = shared_counter();
    let gate = release_gate();

    let f = fired.clone();
    let e = entered.clone();
    let g = gate.clone();
    let pool = WorkerPool::new("listener", FiniteSource::from_iter([0]), 1, move |_, probe| {
        let f = f.clone();
        probe.on_cancel(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        e.fetch_add(1, Ordering::SeqCst);
        block_on(&g);
        Ok(())
    });
    pool.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || entered
        .load(Ordering::SeqCst)
        == 1));

    pool.cancel();
    pool.cancel();
    open(&gate);
    pool.join();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(pool.is_cancelled(0).unwrap());
}

#[test]
fn test_join_worker_waits_for_that_worker_only() {
    let gate = release_gate();
    let entered = Arc::new(AtomicBool::new(false));
    let (g, e) = (gate.clone(), entered.clone());
    let pool = Arc::new(WorkerPool::new(
        "join-one",
        FiniteSource::from_iter(0..2),
        2,
        move |_, probe| {
            if probe.worker_id() == 0 {
                e.store(true, Ordering::SeqCst);
                block_on(&g);
            } else {
                // leave the second item to worker 0
                wait_until(Duration::from_secs(5), || e.load(Ordering::SeqCst));
            }
            Ok(())
        },
    ));
    pool.start().unwrap();

    pool.join_worker(1).unwrap();
    assert!(pool.is_finished(1).unwrap());
    assert!(!pool.is_finished(0).unwrap());
    assert!(!pool.all_finished());

    assert!(matches!(pool.join_worker(2), Err(PoolError::UnknownWorkerId(2))));

    let p = pool.clone();
    let joiner = thread::spawn(move || p.join_worker(0));
    thread::sleep(Duration::from_millis(50));
    assert!(!joiner.is_finished());

    open(&gate);
    joiner.join().unwrap().unwrap();
    assert!(pool.is_finished(0).unwrap());
    assert!(pool.all_finished());
}

//
// 5. Forced interrupts
//
#[test]
fn test_raise_on_rejects_unknown_or_idle_workers() {
    let pool = WorkerPool::new("raise", TaskQueue::<u8>::new(), 2, |_, _| Ok(()));
    assert!(matches!(
        pool.raise_on(5, Signal::Interrupt),
        Err(PoolError::UnknownWorkerId(5))
    ));
    assert!(matches!(
        pool.raise_on(0, Signal::Interrupt),
        Err(PoolError::NoExecutionContext(0))
    ));
    assert!(matches!(
        pool.is_finished(9),
        Err(PoolError::UnknownWorkerId(9))
    ));
}

#[test]
fn test_raise_on_interrupts_sleeping_handler() {
    let entered = shared_counter();
    let e = entered.clone();
    let pool = WorkerPool::new("sleepy", FiniteSource::from_iter([0]), 1, move |_, probe| {
        e.fetch_add(1, Ordering::SeqCst);
        probe.sleep(Duration::from_secs(30))?;
        Ok(())
    });
    pool.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || entered
        .load(Ordering::SeqCst)
        == 1));

    let started = Instant::now();
    pool.raise_on(0, Signal::Interrupt).unwrap();
    pool.join();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(
        pool.outcome(0).unwrap(),
        Some(WorkerOutcome::Interrupted(Signal::Interrupt))
    );
    assert!(matches!(
        pool.raise_on(0, Signal::Interrupt),
        Err(PoolError::NoExecutionContext(0))
    ));
    assert!(pool.raise_on_all(Signal::Interrupt).is_ok());
}

#[test]
fn test_raise_on_all_releases_idle_workers() {
    let executor = TaskExecutor::new("idle-raise", 3, |_: u8, _| Ok(()));
    executor.start().unwrap();
    thread::sleep(Duration::from_millis(50));

    executor.pool().raise_on_all(Signal::Terminate).unwrap();
    assert!(executor.wait(Some(Duration::from_secs(5))));
    executor.join();

    assert!(!executor.pool().all_cancelled());
    assert_eq!(
        executor.pool().outcome(2).unwrap(),
        Some(WorkerOutcome::Interrupted(Signal::Terminate))
    );
}

//
// 6. Failures
//
#[test]
fn test_failing_handler_stops_its_worker() {
    let processed = Arc::new(Mutex::new(Vec::new()));
    let p = processed.clone();
    let pool = WorkerPool::new("failing", FiniteSource::from_iter(1..=4), 1, move |n, _| {
        if n == 2 {
            anyhow::bail!("item {n} is broken");
        }
        p.lock().unwrap().push(n);
        Ok(())
    });
    pool.start().unwrap();
    pool.join();

    assert_eq!(*processed.lock().unwrap(), vec![1]);
    assert!(pool.all_finished());
    assert_eq!(
        pool.outcome(0).unwrap(),
        Some(WorkerOutcome::Failed("item 2 is broken".to_string()))
    );
}

#[test]
fn test_custom_permit_swallows_errors() {
    let pool = PoolBuilder::new("lenient", FiniteSource::from_iter(1..=4), 1)
        .permit(|_| true)
        .build(|_, _| anyhow::bail!("stop here"));
    pool.start().unwrap();
    pool.join();

    assert_eq!(pool.outcome(0).unwrap(), Some(WorkerOutcome::Cancelled));
}

#[test]
fn test_panicking_handler_still_finishes_pool() {
    let pool = WorkerPool::new("panicky", FiniteSource::from_iter([0]), 1, |_, _| {
        panic!("handler exploded");
    });
    pool.start().unwrap();
    pool.join();

    assert!(pool.all_finished());
    assert_eq!(pool.outcome(0).unwrap(), Some(WorkerOutcome::Panicked));
}

//
// 7. Events
//
#[test]
fn test_pool_events() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let pool = WorkerPool::new("events", TaskQueue::<u8>::new(), 2, |_, _| Ok(()));
    for event in [
        PoolEvent::Started,
        PoolEvent::Pause,
        PoolEvent::Resume,
        PoolEvent::Cancel,
        PoolEvent::Finished,
    ] {
        let events = events.clone();
        pool.on(event, move |_| events.lock().unwrap().push(event));
    }
    let ignored = pool.on(PoolEvent::Started, |_| panic!("unsubscribed listener ran"));
    pool.unsubscribe(PoolEvent::Started, &ignored);

    pool.start().unwrap();
    pool.pause();
    pool.resume();
    pool.cancel();
    pool.join();

    let events = events.lock().unwrap();
    assert_eq!(
        events[..3],
        [PoolEvent::Started, PoolEvent::Pause, PoolEvent::Resume]
    );
    assert_eq!(events.len(), 5);
    assert!(events.contains(&PoolEvent::Cancel));
    assert_eq!(
        events.iter().filter(|e| **e == PoolEvent::Finished).count(),
        1
    );
}
