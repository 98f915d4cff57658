// Copyright 2026 the Metronome Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Internal bounded queue utilities.

use std::collections::VecDeque;

/// Bounded FIFO queue with a `drop_oldest` overflow policy.
///
/// Once full, new pushes remove the oldest item before inserting the newest.
#[derive(Debug, Clone)]
pub(crate) struct BoundedQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
    dropped_count: u64,
}

impl<T> BoundedQueue<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            dropped_count: 0,
        }
    }

    /// Pushes `item`, returning the evicted oldest item on overflow.
    pub(crate) fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.dropped_count += 1;
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub(crate) fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub(crate) fn front(&self) -> Option<&T> {
        self.items.front()
    }

    /// Drops everything except the newest item. Returns how many were dropped.
    pub(crate) fn keep_newest(&mut self) -> usize {
        let excess = self.items.len().saturating_sub(1);
        self.items.drain(..excess);
        self.dropped_count += excess as u64;
        excess
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn dropped_count(&self) -> u64 {
        self.dropped_count
    }
}

#[cfg(test)]
mod tests {
    use super::BoundedQueue;

    #[test]
    fn zero_capacity_is_promoted_to_one() {
        let mut queue = BoundedQueue::with_capacity(0);
        assert_eq!(queue.push(10_u32), None);
        assert_eq!(queue.push(11_u32), Some(10_u32));

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some(11_u32));
        assert_eq!(queue.dropped_count(), 1);
    }

    #[test]
    fn push_over_capacity_evicts_oldest() {
        let mut queue = BoundedQueue::with_capacity(2);
        queue.push(1_u32);
        queue.push(2_u32);
        assert_eq!(queue.push(3_u32), Some(1_u32));

        assert_eq!(queue.front(), Some(&2_u32));
        assert_eq!(queue.pop(), Some(2_u32));
        assert_eq!(queue.pop(), Some(3_u32));
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.dropped_count(), 1);
    }

    #[test]
    fn keep_newest_drops_backlog() {
        let mut queue = BoundedQueue::with_capacity(8);
        for i in 0..5_u32 {
            queue.push(i);
        }
        assert_eq!(queue.keep_newest(), 4);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.front(), Some(&4_u32));
        assert_eq!(queue.dropped_count(), 4);

        queue.clear();
        assert_eq!(queue.keep_newest(), 0, "empty queue has nothing to drop");
    }

    #[test]
    fn iter_runs_oldest_first() {
        let mut queue = BoundedQueue::with_capacity(3);
        for i in 1..=4_u32 {
            queue.push(i);
        }
        let items: Vec<u32> = queue.iter().copied().collect();
        assert_eq!(items, [2, 3, 4]);
    }

    #[test]
    fn empty_queue_reports_is_empty() {
        let mut queue = BoundedQueue::with_capacity(2);
        assert!(queue.is_empty());

        queue.push(1_u32);
        assert!(!queue.is_empty());

        let _ = queue.pop();
        assert!(queue.is_empty());
    }
}
