// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::job_engine::error::PoolError;
use crate::job_engine::probe::CancelProbe;
use crate::job_engine::source::TaskQueue;
use crate::job_engine::worker_pool::WorkerPool;

/// Queue-backed facade over a [`WorkerPool`]: submit, clear, cancel, join.
///
/// Cloning gives another handle to the same queue and workers.
pub struct TaskExecutor<T: Send + 'static> {
    pool: Arc<WorkerPool<TaskQueue<T>>>,
}

impl<T: Send + 'static> Clone for TaskExecutor<T> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
        }
    }
}

impl<T: Send + 'static> TaskExecutor<T> {
    pub fn new<F>(name: &str, workers: usize, handler: F) -> Self
    where
        F: Fn(T, &CancelProbe<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            pool: Arc::new(WorkerPool::new(name, TaskQueue::new(), workers, handler)),
        }
    }

    pub fn start(&self) -> Result<(), PoolError> {
        self.pool.start()
    }

    /// Appends `item` to the queue. Never blocks.
    pub fn submit(&self, item: T) {
        self.pool.with_source(|queue| queue.push(item));
    }

    /// Discards everything queued but not yet claimed and returns how many
    /// items were dropped.
    ///
    /// Workers are paused around the swap so none of them is between the
    /// gate and the dequeue while the queue is replaced.
    pub fn clear(&self) -> usize {
        self.pool.pause();
        let discarded = self.pool.with_source(TaskQueue::clear);
        self.pool.resume();
        debug!("{}: discarded {discarded} queued items", self.pool.name());
        discarded
    }

    /// Cancels the workers, drops the backlog and ends the queue so idle
    /// workers are released.
    pub fn cancel(&self) {
        self.pool.cancel();
        self.clear();
        self.pool.with_source(TaskQueue::push_sentinel);
    }

    pub fn join(&self) {
        self.pool.join();
    }

    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.pool.wait(timeout)
    }

    pub fn pending(&self) -> usize {
        self.pool.with_source(|queue| queue.len())
    }

    pub fn pool(&self) -> &WorkerPool<TaskQueue<T>> {
        &self.pool
    }
}
