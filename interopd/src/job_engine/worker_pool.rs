// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::job_engine::error::{interruption, Interrupted, PoolError, Signal};
use crate::job_engine::event_hub::{EventHub, Listener};
use crate::job_engine::probe::{CancelProbe, WorkerSignals};
use crate::job_engine::source::{ItemSource, Pull};

/// Pool-level state changes published on the pool's event hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolEvent {
    Started,
    Pause,
    Resume,
    Cancel,
    Finished,
}

/// Why a worker left its loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Exhausted,
    Cancelled,
    Interrupted(Signal),
    Failed(String),
    Panicked,
}

impl WorkerOutcome {
    fn stopped_by(signal: Signal) -> Self {
        match signal {
            Signal::Cancel => WorkerOutcome::Cancelled,
            other => WorkerOutcome::Interrupted(other),
        }
    }
}

type Handler<T> = dyn Fn(T, &CancelProbe<'_>) -> anyhow::Result<()> + Send + Sync;
type Permit = dyn Fn(&anyhow::Error) -> bool + Send + Sync;

struct Exits {
    live: usize,
    all_finished: bool,
}

enum Dequeued<T> {
    Item(T),
    Exhausted,
    Paused,
}

struct Shared<S: ItemSource> {
    name: String,
    source: Mutex<S>,
    item_ready: Condvar,
    handler: Box<Handler<S::Item>>,
    permitted: Box<Permit>,
    workers: Vec<WorkerSignals>,
    outcomes: Mutex<Vec<Option<WorkerOutcome>>>,
    started: AtomicBool,
    exits: Mutex<Exits>,
    exited: Condvar,
    events: Mutex<EventHub<PoolEvent>>,
}

impl<S: ItemSource> Shared<S> {
    fn emit(&self, event: PoolEvent) {
        // publish on a snapshot so listeners may (un)subscribe
        let hub = self.events.lock().unwrap().clone();
        hub.publish(&event, &());
    }

    /// Wakes workers parked on an empty source so they re-check their
    /// signals.
    fn wake_waiters(&self) {
        let _source = self.source.lock().unwrap();
        self.item_ready.notify_all();
    }

    fn next_item(&self, signals: &WorkerSignals) -> Result<Dequeued<S::Item>, Interrupted> {
        let mut source = self.source.lock().unwrap();
        loop {
            if let Some(signal) = signals.stop_signal() {
                return Err(Interrupted(signal));
            }
            if signals.is_paused() {
                return Ok(Dequeued::Paused);
            }
            match source.pull() {
                Pull::Item(item) => return Ok(Dequeued::Item(item)),
                Pull::Exhausted => return Ok(Dequeued::Exhausted),
                Pull::Pending => source = self.item_ready.wait(source).unwrap(),
            }
        }
    }

    fn run_worker(&self, id: usize) -> WorkerOutcome {
        let signals = &self.workers[id];
        loop {
            if let Err(Interrupted(signal)) = signals.pass_gate() {
                return WorkerOutcome::stopped_by(signal);
            }
            let item = match self.next_item(signals) {
                Ok(Dequeued::Item(item)) => item,
                Ok(Dequeued::Exhausted) => return WorkerOutcome::Exhausted,
                Ok(Dequeued::Paused) => continue,
                Err(Interrupted(signal)) => return WorkerOutcome::stopped_by(signal),
            };

            let result = (self.handler)(item, &CancelProbe::new(signals));
            signals.release_iteration_listeners();

            if let Err(err) = result {
                if (self.permitted)(&err) {
                    debug!("{}-{}: stopping on permitted error: {err}", self.name, id);
                    return interruption(&err)
                        .map(|Interrupted(signal)| WorkerOutcome::stopped_by(signal))
                        .unwrap_or(WorkerOutcome::Cancelled);
                }
                warn!("{}-{}: handler failed, worker stops: {err:#}", self.name, id);
                return WorkerOutcome::Failed(format!("{err:#}"));
            }
            if let Some(signal) = signals.pending_interrupt() {
                return WorkerOutcome::Interrupted(signal);
            }
        }
    }

    /// Records the outcome of worker `id`. The last worker to exit marks the
    /// pool finished and publishes [`PoolEvent::Finished`].
    fn worker_exited(&self, id: usize, outcome: WorkerOutcome) {
        debug!("{}-{}: exited ({outcome:?})", self.name, id);
        self.outcomes.lock().unwrap()[id] = Some(outcome);
        let last = {
            let mut exits = self.exits.lock().unwrap();
            self.workers[id].mark_finished();
            exits.live -= 1;
            if exits.live == 0 {
                exits.all_finished = true;
            }
            self.exited.notify_all();
            exits.all_finished
        };
        if last {
            self.finish();
        }
    }

    fn finish(&self) {
        info!("pool {} finished", self.name);
        self.emit(PoolEvent::Finished);
    }
}

/// Reports the worker's exit even when the handler unwinds.
struct ExitGuard<'a, S: ItemSource> {
    shared: &'a Shared<S>,
    id: usize,
    outcome: WorkerOutcome,
}

impl<S: ItemSource> Drop for ExitGuard<'_, S> {
    fn drop(&mut self) {
        let outcome = std::mem::replace(&mut self.outcome, WorkerOutcome::Panicked);
        self.shared.worker_exited(self.id, outcome);
    }
}

pub struct PoolBuilder<S: ItemSource> {
    name: String,
    source: S,
    workers: usize,
    permitted: Box<Permit>,
}

impl<S: ItemSource> PoolBuilder<S> {
    pub fn new(name: impl Into<String>, source: S, workers: usize) -> Self {
        Self {
            name: name.into(),
            source,
            workers,
            permitted: Box::new(|err: &anyhow::Error| interruption(err).is_some()),
        }
    }

    /// Replaces the predicate that decides which handler errors end a
    /// worker quietly. By default only [`Interrupted`] is permitted.
    pub fn permit(mut self, f: impl Fn(&anyhow::Error) -> bool + Send + Sync + 'static) -> Self {
        self.permitted = Box::new(f);
        self
    }

    pub fn build<F>(self, handler: F) -> WorkerPool<S>
    where
        F: Fn(S::Item, &CancelProbe<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let workers = match self.source.remaining() {
            Some(len) => self.workers.min(len),
            None => self.workers,
        };
        let shared = Shared {
            name: self.name,
            source: Mutex::new(self.source),
            item_ready: Condvar::new(),
            handler: Box::new(handler),
            permitted: self.permitted,
            workers: (0..workers).map(WorkerSignals::new).collect(),
            outcomes: Mutex::new(vec![None; workers]),
            started: AtomicBool::new(false),
            exits: Mutex::new(Exits {
                live: workers,
                all_finished: false,
            }),
            exited: Condvar::new(),
            events: Mutex::new(EventHub::new()),
        };
        WorkerPool {
            shared: Arc::new(shared),
            threads: Mutex::new(Vec::new()),
        }
    }
}

/// Fixed-size set of worker threads pulling from one shared source.
///
/// Each worker loops: wait while paused, dequeue under the pool lock, run
/// the handler with a [`CancelProbe`]. Workers leave when the source is
/// exhausted, when they are cancelled or interrupted, or when the handler
/// fails with an error that is not permitted. Failed workers are not
/// restarted.
pub struct WorkerPool<S: ItemSource> {
    shared: Arc<Shared<S>>,
    threads: Mutex<Vec<Option<JoinHandle<()>>>>,
}

impl<S: ItemSource> WorkerPool<S> {
    pub fn new<F>(name: impl Into<String>, source: S, workers: usize, handler: F) -> Self
    where
        F: Fn(S::Item, &CancelProbe<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        PoolBuilder::new(name, source, workers).build(handler)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn worker_count(&self) -> usize {
        self.shared.workers.len()
    }

    pub fn start(&self) -> Result<(), PoolError> {
        let shared = &self.shared;
        if shared.started.swap(true, Ordering::SeqCst) {
            return Err(PoolError::AlreadyStarted);
        }
        info!("starting pool {} with {} workers", shared.name, shared.workers.len());
        shared.emit(PoolEvent::Started);

        if shared.workers.is_empty() {
            shared.exits.lock().unwrap().all_finished = true;
            shared.exited.notify_all();
            shared.finish();
            return Ok(());
        }

        let mut threads = self.threads.lock().unwrap();
        for id in 0..shared.workers.len() {
            let worker_shared = Arc::clone(shared);
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", shared.name, id))
                .spawn(move || {
                    let mut guard = ExitGuard {
                        shared: &worker_shared,
                        id,
                        outcome: WorkerOutcome::Panicked,
                    };
                    guard.outcome = worker_shared.run_worker(id);
                });
            match spawned {
                Ok(handle) => threads.push(Some(handle)),
                Err(err) => {
                    // the remaining workers will never run; account for them
                    for never_ran in id..shared.workers.len() {
                        shared.workers[never_ran].cancel();
                        shared.worker_exited(never_ran, WorkerOutcome::Failed(err.to_string()));
                    }
                    return Err(PoolError::Spawn(err));
                }
            }
        }
        Ok(())
    }

    pub fn has_started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }

    /// Cancels every worker. Workers parked on the gate or on an empty
    /// source are woken; busy workers notice at their next probe check or
    /// after the current item. Idempotent.
    pub fn cancel(&self) {
        for signals in &self.shared.workers {
            signals.cancel();
        }
        self.shared.wake_waiters();
        self.shared.emit(PoolEvent::Cancel);
    }

    /// Workers finish their current item and then hold before the next one.
    pub fn pause(&self) {
        for signals in &self.shared.workers {
            signals.set_paused(true);
        }
        self.shared.wake_waiters();
        self.shared.emit(PoolEvent::Pause);
    }

    pub fn resume(&self) {
        for signals in &self.shared.workers {
            signals.set_paused(false);
        }
        self.shared.wake_waiters();
        self.shared.emit(PoolEvent::Resume);
    }

    /// Blocks until every worker has exited or `timeout` elapsed. Returns
    /// whether the pool finished.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let exits = self.shared.exits.lock().unwrap();
        match timeout {
            None => {
                self.shared
                    .exited
                    .wait_while(exits, |e| !e.all_finished)
                    .unwrap()
                    .all_finished
            }
            Some(timeout) => {
                self.shared
                    .exited
                    .wait_timeout_while(exits, timeout, |e| !e.all_finished)
                    .unwrap()
                    .0
                    .all_finished
            }
        }
    }

    /// Blocks until all workers have terminated. Returns immediately for a
    /// pool that was never started.
    pub fn join(&self) {
        let handles: Vec<_> = self
            .threads
            .lock()
            .unwrap()
            .iter_mut()
            .filter_map(Option::take)
            .collect();
        for handle in handles {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                warn!("{name}: worker thread panicked");
            }
        }
        if self.has_started() {
            self.wait(None);
        }
    }

    pub fn join_worker(&self, id: usize) -> Result<(), PoolError> {
        let signals = self.signals(id)?;
        let handle = self
            .threads
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(Option::take);
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("{}-{}: worker thread panicked", self.shared.name, id);
            }
        }
        if self.has_started() {
            let exits = self.shared.exits.lock().unwrap();
            let _exits = self
                .shared
                .exited
                .wait_while(exits, |_| !signals.is_finished())
                .unwrap();
        }
        Ok(())
    }

    pub fn is_finished(&self, id: usize) -> Result<bool, PoolError> {
        Ok(self.has_started() && self.signals(id)?.is_finished())
    }

    pub fn all_finished(&self) -> bool {
        self.shared.exits.lock().unwrap().all_finished
    }

    pub fn is_cancelled(&self, id: usize) -> Result<bool, PoolError> {
        Ok(self.signals(id)?.is_cancelled())
    }

    pub fn all_cancelled(&self) -> bool {
        self.shared.workers.iter().all(WorkerSignals::is_cancelled)
    }

    pub fn outcome(&self, id: usize) -> Result<Option<WorkerOutcome>, PoolError> {
        self.signals(id)?;
        Ok(self.shared.outcomes.lock().unwrap()[id].clone())
    }

    /// Forces worker `id` out of its loop.
    ///
    /// Best effort: Rust cannot unwind another thread, so the interrupt
    /// lands at the next interruption point the worker reaches (the pause
    /// gate, the dequeue wait, the end of the current item, or a probe
    /// `checkpoint`/`sleep` inside the handler). A handler blocked elsewhere
    /// keeps running until it returns.
    pub fn raise_on(&self, id: usize, signal: Signal) -> Result<(), PoolError> {
        let signals = self.signals(id)?;
        if !self.has_started() || signals.is_finished() {
            return Err(PoolError::NoExecutionContext(id));
        }
        debug!("{}-{}: raising {signal:?}", self.shared.name, id);
        signals.interrupt(signal);
        self.shared.wake_waiters();
        Ok(())
    }

    /// Interrupts every worker that is still running.
    pub fn raise_on_all(&self, signal: Signal) -> Result<(), PoolError> {
        for (id, signals) in self.shared.workers.iter().enumerate() {
            if signals.is_finished() {
                continue;
            }
            self.raise_on(id, signal)?;
        }
        Ok(())
    }

    pub fn subscribe(&self, event: PoolEvent, listener: Listener<()>) {
        self.shared.events.lock().unwrap().subscribe(event, listener);
    }

    pub fn on(&self, event: PoolEvent, f: impl Fn(&()) + Send + Sync + 'static) -> Listener<()> {
        self.shared.events.lock().unwrap().on(event, f)
    }

    pub fn unsubscribe(&self, event: PoolEvent, listener: &Listener<()>) {
        self.shared
            .events
            .lock()
            .unwrap()
            .unsubscribe(&event, listener);
    }

    /// Runs `f` on the source under the dequeue lock, then wakes workers
    /// waiting for items.
    pub fn with_source<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut source = self.shared.source.lock().unwrap();
        let result = f(&mut source);
        self.shared.item_ready.notify_all();
        result
    }

    fn signals(&self, id: usize) -> Result<&WorkerSignals, PoolError> {
        self.shared
            .workers
            .get(id)
            .ok_or(PoolError::UnknownWorkerId(id))
    }
}
