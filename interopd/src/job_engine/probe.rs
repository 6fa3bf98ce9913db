// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::job_engine::error::{Interrupted, Signal};

struct Gate {
    paused: bool,
    interrupt: Option<Signal>,
}

struct CancelListener {
    persistent: bool,
    callback: Box<dyn FnOnce() + Send>,
}

/// Per-worker control state shared between the pool owner and the worker
/// thread.
///
/// `cancelled` only ever goes from false to true. Everything a parked
/// worker may be waiting for (resume, cancel, interrupt) is signalled on
/// `wake` while holding the gate lock.
pub(crate) struct WorkerSignals {
    id: usize,
    cancelled: AtomicBool,
    finished: AtomicBool,
    gate: Mutex<Gate>,
    wake: Condvar,
    listeners: Mutex<Vec<CancelListener>>,
}

impl WorkerSignals {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            gate: Mutex::new(Gate {
                paused: false,
                interrupt: None,
            }),
            wake: Condvar::new(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.gate.lock().unwrap().paused
    }

    pub(crate) fn pending_interrupt(&self) -> Option<Signal> {
        self.gate.lock().unwrap().interrupt
    }

    /// Interrupt first, then cancellation.
    pub(crate) fn stop_signal(&self) -> Option<Signal> {
        let gate = self.gate.lock().unwrap();
        self.stop_signal_locked(&gate)
    }

    fn stop_signal_locked(&self, gate: &MutexGuard<'_, Gate>) -> Option<Signal> {
        gate.interrupt
            .or_else(|| self.is_cancelled().then_some(Signal::Cancel))
    }

    /// Sets the cancelled flag and runs the registered cancel listeners.
    /// Returns false if the worker had already been cancelled.
    pub(crate) fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        let callbacks: Vec<_> = self
            .listeners
            .lock()
            .unwrap()
            .drain(..)
            .map(|listener| listener.callback)
            .collect();
        for callback in callbacks {
            callback();
        }
        self.notify();
        true
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.gate.lock().unwrap().paused = paused;
        self.wake.notify_all();
    }

    pub(crate) fn interrupt(&self, signal: Signal) {
        self.gate.lock().unwrap().interrupt = Some(signal);
        self.wake.notify_all();
    }

    fn notify(&self) {
        let _gate = self.gate.lock().unwrap();
        self.wake.notify_all();
    }

    /// Blocks while the worker is paused. Returns the stop signal instead if
    /// the worker was cancelled or interrupted, paused or not.
    pub(crate) fn pass_gate(&self) -> Result<(), Interrupted> {
        let mut gate = self.gate.lock().unwrap();
        loop {
            if let Some(signal) = self.stop_signal_locked(&gate) {
                return Err(Interrupted(signal));
            }
            if !gate.paused {
                return Ok(());
            }
            gate = self.wake.wait(gate).unwrap();
        }
    }

    /// A duration past what `Instant` can represent sleeps until cancel or
    /// interrupt.
    fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        let deadline = Instant::now().checked_add(duration);
        let mut gate = self.gate.lock().unwrap();
        loop {
            if let Some(signal) = self.stop_signal_locked(&gate) {
                return Err(Interrupted(signal));
            }
            gate = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(());
                    }
                    self.wake.wait_timeout(gate, deadline - now).unwrap().0
                }
                None => self.wake.wait(gate).unwrap(),
            };
        }
    }

    fn add_listener(&self, persistent: bool, callback: Box<dyn FnOnce() + Send>) {
        let mut listeners = self.listeners.lock().unwrap();
        // checked under the listener lock so a concurrent cancel either sees
        // this listener or we see its flag
        if self.is_cancelled() {
            drop(listeners);
            callback();
        } else {
            listeners.push(CancelListener {
                persistent,
                callback,
            });
        }
    }

    /// Drops the listeners registered during the iteration that just ended.
    pub(crate) fn release_iteration_listeners(&self) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|listener| listener.persistent);
    }
}

/// Cancellation probe handed to a pool handler for the item it is working
/// on.
pub struct CancelProbe<'a> {
    signals: &'a WorkerSignals,
}

impl<'a> CancelProbe<'a> {
    pub(crate) fn new(signals: &'a WorkerSignals) -> Self {
        Self { signals }
    }

    pub fn worker_id(&self) -> usize {
        self.signals.id()
    }

    pub fn is_cancelled(&self) -> bool {
        self.signals.is_cancelled()
    }

    /// Runs `f` once cancellation is requested, or right away if it already
    /// was. The registration ends with the current item.
    pub fn on_cancel(&self, f: impl FnOnce() + Send + 'static) {
        self.signals.add_listener(false, Box::new(f));
    }

    /// Like [`on_cancel`](Self::on_cancel), but the registration outlives
    /// the current item.
    pub fn on_cancel_persistent(&self, f: impl FnOnce() + Send + 'static) {
        self.signals.add_listener(true, Box::new(f));
    }

    /// Interruption point: fails if the worker was cancelled or a forced
    /// interrupt is pending.
    pub fn checkpoint(&self) -> Result<(), Interrupted> {
        match self.signals.stop_signal() {
            Some(signal) => Err(Interrupted(signal)),
            None => Ok(()),
        }
    }

    /// Sleeps for `duration` unless cancellation or an interrupt arrives
    /// first.
    pub fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        self.signals.sleep(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn plain_probe_reflects_cancellation() {
        let signals = WorkerSignals::new(3);
        let probe = CancelProbe::new(&signals);
        assert_eq!(probe.worker_id(), 3);
        assert!(!probe.is_cancelled());
        assert!(probe.checkpoint().is_ok());

        assert!(signals.cancel());
        assert!(!signals.cancel());
        assert!(probe.is_cancelled());
        assert_eq!(probe.checkpoint(), Err(Interrupted(Signal::Cancel)));
    }

    #[test]
    fn listener_runs_once_on_cancel_or_immediately_afterwards() {
        let signals = WorkerSignals::new(0);
        let probe = CancelProbe::new(&signals);
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        probe.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        signals.cancel();
        signals.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let c = calls.clone();
        probe.on_cancel(move || {
            c.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn iteration_listeners_are_released() {
        let signals = WorkerSignals::new(0);
        let probe = CancelProbe::new(&signals);
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        probe.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c = calls.clone();
        probe.on_cancel_persistent(move || {
            c.fetch_add(100, Ordering::SeqCst);
        });
        signals.release_iteration_listeners();

        signals.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn sleep_is_cut_short_by_interrupt() {
        let signals = Arc::new(WorkerSignals::new(0));
        let s = signals.clone();
        let sleeper = thread::spawn(move || {
            let started = Instant::now();
            let result = CancelProbe::new(&s).sleep(Duration::from_secs(10));
            (result, started.elapsed())
        });

        thread::sleep(Duration::from_millis(50));
        signals.interrupt(Signal::Terminate);

        let (result, elapsed) = sleeper.join().unwrap();
        assert_eq!(result, Err(Interrupted(Signal::Terminate)));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn unrepresentable_sleep_waits_for_cancel() {
        let signals = Arc::new(WorkerSignals::new(0));
        let s = signals.clone();
        let sleeper = thread::spawn(move || CancelProbe::new(&s).sleep(Duration::MAX));

        thread::sleep(Duration::from_millis(50));
        assert!(!sleeper.is_finished());
        signals.cancel();

        assert_eq!(sleeper.join().unwrap(), Err(Interrupted(Signal::Cancel)));
    }

    #[test]
    fn paused_gate_is_released_by_cancel() {
        let signals = Arc::new(WorkerSignals::new(0));
        signals.set_paused(true);
        assert!(signals.is_paused());

        let s = signals.clone();
        let waiter = thread::spawn(move || s.pass_gate());
        thread::sleep(Duration::from_millis(50));
        signals.cancel();

        assert_eq!(waiter.join().unwrap(), Err(Interrupted(Signal::Cancel)));
    }
}
