// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::VecDeque;

/// Result of one dequeue attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Pull<T> {
    Item(T),
    /// Nothing queued right now; the worker waits for a submission.
    Pending,
    /// The source is done for every worker.
    Exhausted,
}

/// Shared item source of a worker pool.
///
/// `pull` is always called with the pool's dequeue lock held, so an item is
/// handed to exactly one worker.
pub trait ItemSource: Send + 'static {
    type Item: Send + 'static;

    fn pull(&mut self) -> Pull<Self::Item>;

    /// Number of items left if the source is bounded.
    fn remaining(&self) -> Option<usize> {
        None
    }
}

/// A bounded sequence, exhausted once drained.
#[derive(Debug)]
pub struct FiniteSource<T> {
    items: VecDeque<T>,
}

impl<T> FromIterator<T> for FiniteSource<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

impl<T: Send + 'static> ItemSource for FiniteSource<T> {
    type Item = T;

    fn pull(&mut self) -> Pull<T> {
        match self.items.pop_front() {
            Some(item) => Pull::Item(item),
            None => Pull::Exhausted,
        }
    }

    fn remaining(&self) -> Option<usize> {
        Some(self.items.len())
    }
}

/// Unbounded, refillable FIFO with an in-band end sentinel.
///
/// Once a sentinel is dequeued the queue stays exhausted for all later
/// pulls, so a single sentinel releases every waiting worker.
#[derive(Debug)]
pub struct TaskQueue<T> {
    items: VecDeque<Option<T>>,
    ended: bool,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
            ended: false,
        }
    }

    pub fn push(&mut self, item: T) {
        self.items.push_back(Some(item));
    }

    pub fn push_sentinel(&mut self) {
        self.items.push_back(None);
    }

    /// Swaps the backing queue for an empty one and returns how many real
    /// items were discarded. The old queue is dropped, not reused.
    pub fn clear(&mut self) -> usize {
        let discarded = std::mem::take(&mut self.items);
        discarded.iter().filter(|slot| slot.is_some()).count()
    }

    /// Items waiting to be dequeued, sentinels excluded.
    pub fn len(&self) -> usize {
        self.items.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_ended(&self) -> bool {
        self.ended
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> ItemSource for TaskQueue<T> {
    type Item = T;

    fn pull(&mut self) -> Pull<T> {
        if self.ended {
            return Pull::Exhausted;
        }
        match self.items.pop_front() {
            Some(Some(item)) => Pull::Item(item),
            Some(None) => {
                self.ended = true;
                Pull::Exhausted
            }
            None => Pull::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finite_source_drains_in_order() {
        let mut source: FiniteSource<u32> = (1..=2).collect();
        assert_eq!(source.remaining(), Some(2));
        assert_eq!(source.pull(), Pull::Item(1));
        assert_eq!(source.pull(), Pull::Item(2));
        assert_eq!(source.pull(), Pull::Exhausted);
    }

    #[test]
    fn sentinel_end_is_sticky() {
        let mut queue = TaskQueue::new();
        assert_eq!(queue.pull(), Pull::Pending);

        queue.push("a");
        queue.push_sentinel();
        queue.push("after-end");

        assert_eq!(queue.pull(), Pull::Item("a"));
        assert_eq!(queue.pull(), Pull::Exhausted);
        assert!(queue.has_ended());
        assert_eq!(queue.pull(), Pull::Exhausted);
    }

    #[test]
    fn clear_counts_only_real_items() {
        let mut queue = TaskQueue::new();
        for i in 0..5 {
            queue.push(i);
        }
        queue.push_sentinel();
        assert_eq!(queue.len(), 5);

        assert_eq!(queue.clear(), 5);
        assert!(queue.is_empty());
        assert_eq!(queue.pull(), Pull::Pending);
    }
}
