//! Three-tier priority blocking queue.
//!
//! `add` never blocks. `take` blocks the calling thread until an item is
//! available and returns the oldest item of the highest non-empty tier.
//! High items can starve Low items indefinitely; tiers are strict.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Priority tier of a queued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Drained last.
    Low,
    /// Default tier.
    #[default]
    Normal,
    /// Drained first.
    High,
}

#[derive(Debug)]
struct Tiers<T> {
    high: VecDeque<T>,
    normal: VecDeque<T>,
    low: VecDeque<T>,
}

impl<T> Tiers<T> {
    fn pop(&mut self) -> Option<T> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }
}

/// Many-producer, many-consumer priority queue.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    tiers: Mutex<Tiers<T>>,
    available: Condvar,
}

impl<T> PriorityQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            tiers: Mutex::new(Tiers {
                high: VecDeque::new(),
                normal: VecDeque::new(),
                low: VecDeque::new(),
            }),
            available: Condvar::new(),
        }
    }

    // A panic while holding the lock leaves the deques intact, so poisoning
    // is ignored.
    fn lock(&self) -> MutexGuard<'_, Tiers<T>> {
        self.tiers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueues `item` at the back of its tier.
    pub fn add(&self, item: T, priority: Priority) {
        {
            let mut tiers = self.lock();
            match priority {
                Priority::High => tiers.high.push_back(item),
                Priority::Normal => tiers.normal.push_back(item),
                Priority::Low => tiers.low.push_back(item),
            }
        }
        self.available.notify_one();
    }

    /// Blocks until an item is available and returns it.
    pub fn take(&self) -> T {
        let mut tiers = self.lock();
        loop {
            if let Some(item) = tiers.pop() {
                return item;
            }
            tiers = self
                .available
                .wait(tiers)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Like [`take`](Self::take) but gives up after `timeout`.
    pub fn take_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut tiers = self.lock();
        loop {
            if let Some(item) = tiers.pop() {
                return Some(item);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _) = self
                .available
                .wait_timeout(tiers, remaining)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            tiers = guard;
        }
    }

    /// Returns an item if one is immediately available.
    pub fn try_take(&self) -> Option<T> {
        self.lock().pop()
    }

    /// Total number of queued items across all tiers.
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Alias for [`count`](Self::count).
    pub fn len(&self) -> usize {
        self.count()
    }

    /// Whether no items are queued.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
