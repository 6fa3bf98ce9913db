// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>
//! # Design: Thread-Based Worker Pools
//!
//! ## Overview
//! Every executor is a fixed set of OS threads pulling from one shared source.
//!
//! - Dequeue happens under a single lock per pool, so an item is claimed once.
//! - A pool starts exactly once; it can be paused, resumed and cancelled as a unit.
//! - Cancellation is cooperative (the handler's [`CancelProbe`]); forced
//!   interrupts are best effort and land at the next interruption point.
//! - The last worker to exit marks the pool finished. There is no coordinator thread.
//!
//! ```text
//!         +------------------------------------+
//!         |       TaskExecutor (submit/clear)  |
//!         +-----------------+------------------+
//!                           |
//!                           v
//!         +-----------------+------------------+
//!         |  TaskQueue behind the dequeue lock |
//!         +----+-----------+-----------+-------+
//!              |           |           |
//!         +----v----+ +----v----+ +----v----+
//!         | worker0 | | worker1 | | worker2 |
//!         |  loop() | |  loop() | |  loop() |
//!         +---------+ +---------+ +---------+
//! ```

pub mod error;
pub mod event_hub;
pub mod probe;
pub mod source;
pub mod task_executor;
pub mod worker_pool;

pub use error::{Interrupted, PoolError, Signal};
pub use event_hub::{EventHub, Listener};
pub use probe::CancelProbe;
pub use source::{FiniteSource, ItemSource, Pull, TaskQueue};
pub use task_executor::TaskExecutor;
pub use worker_pool::{PoolBuilder, PoolEvent, WorkerOutcome, WorkerPool};

#[cfg(test)]
mod tests;
