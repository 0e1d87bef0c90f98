// src/timer.rs
//! Binary min-heap of idle deadlines keyed by connection id.
//!
//! A side index maps each id to its heap slot so refresh and removal of an
//! arbitrary entry stay `O(log n)`. Expired entries are evicted lazily by
//! [`TimerHeap::tick`], which the reactor drives through
//! [`TimerHeap::next_tick`] to size its poll timeout.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

pub type TimeoutCallback = Box<dyn FnOnce() + Send>;

struct TimerNode<K> {
    id: K,
    expires: Instant,
    callback: TimeoutCallback,
}

pub struct TimerHeap<K> {
    heap: Vec<TimerNode<K>>,
    index: HashMap<K, usize>,
}

impl<K: Copy + Eq + Hash> TimerHeap<K> {
    pub fn new() -> Self {
        Self {
            heap: Vec::with_capacity(64),
            index: HashMap::with_capacity(64),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: K) -> bool {
        self.index.contains_key(&id)
    }

    /// Deadline of the earliest entry.
    pub fn peek_deadline(&self) -> Option<Instant> {
        self.heap.first().map(|n| n.expires)
    }

    /// Track `id` to expire `timeout` from now. An already tracked id gets its
    /// deadline and callback replaced in place.
    pub fn add(&mut self, id: K, timeout: Duration, callback: TimeoutCallback) {
        let expires = Instant::now() + timeout;
        match self.index.get(&id).copied() {
            Some(i) => {
                self.heap[i].expires = expires;
                self.heap[i].callback = callback;
                self.restore(i);
            }
            None => {
                let i = self.heap.len();
                self.index.insert(id, i);
                self.heap.push(TimerNode {
                    id,
                    expires,
                    callback,
                });
                self.sift_up(i);
            }
        }
    }

    /// Slide the deadline of `id` to `timeout` from now. Returns `false` when
    /// the id is not tracked.
    pub fn adjust(&mut self, id: K, timeout: Duration) -> bool {
        let Some(i) = self.index.get(&id).copied() else {
            return false;
        };
        self.heap[i].expires = Instant::now() + timeout;
        self.restore(i);
        true
    }

    /// Run the callback of `id` immediately and stop tracking it.
    pub fn fire(&mut self, id: K) -> bool {
        match self.index.get(&id).copied() {
            Some(i) => {
                let node = self.remove_at(i);
                (node.callback)();
                true
            }
            None => false,
        }
    }

    /// Stop tracking `id` without running its callback.
    pub fn remove(&mut self, id: K) -> bool {
        match self.index.get(&id).copied() {
            Some(i) => {
                self.remove_at(i);
                true
            }
            None => false,
        }
    }

    /// Drop the earliest entry without running its callback.
    pub fn pop(&mut self) -> Option<K> {
        if self.heap.is_empty() {
            return None;
        }
        Some(self.remove_at(0).id)
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    /// Evict every entry whose deadline has passed, running its callback.
    /// Returns the number of callbacks run.
    pub fn tick(&mut self) -> usize {
        let now = Instant::now();
        let mut fired = 0;
        while let Some(root) = self.heap.first() {
            if root.expires > now {
                break;
            }
            let node = self.remove_at(0);
            (node.callback)();
            fired += 1;
        }
        fired
    }

    /// Evict expired entries, then report how long until the next deadline.
    /// `None` means nothing is tracked and the caller may block indefinitely.
    pub fn next_tick(&mut self) -> Option<Duration> {
        self.tick();
        self.heap
            .first()
            .map(|n| n.expires.saturating_duration_since(Instant::now()))
    }

    fn remove_at(&mut self, i: usize) -> TimerNode<K> {
        let node = self.heap.swap_remove(i);
        self.index.remove(&node.id);
        if i < self.heap.len() {
            self.index.insert(self.heap[i].id, i);
            self.restore(i);
        }
        node
    }

    fn restore(&mut self, i: usize) {
        if !self.sift_down(i) {
            self.sift_up(i);
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap_nodes(i, parent);
            i = parent;
        }
    }

    /// Push the node at `start` down until neither child is earlier. Returns
    /// whether it moved.
    fn sift_down(&mut self, start: usize) -> bool {
        let n = self.heap.len();
        let mut i = start;
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let mut child = left;
            if left + 1 < n && self.heap[left + 1].expires < self.heap[left].expires {
                child = left + 1;
            }
            if self.heap[child].expires >= self.heap[i].expires {
                break;
            }
            self.swap_nodes(i, child);
            i = child;
        }
        i > start
    }

    fn swap_nodes(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.index.insert(self.heap[i].id, i);
        self.index.insert(self.heap[j].id, j);
    }

    #[cfg(test)]
    fn assert_heap_property(&self) {
        for i in 1..self.heap.len() {
            let parent = (i - 1) / 2;
            assert!(
                self.heap[parent].expires <= self.heap[i].expires,
                "heap violated at {i}"
            );
        }
        assert_eq!(self.index.len(), self.heap.len());
        for (i, node) in self.heap.iter().enumerate() {
            assert_eq!(self.index[&node.id], i);
        }
    }
}

impl<K: Copy + Eq + Hash> Default for TimerHeap<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn noop() -> TimeoutCallback {
        Box::new(|| {})
    }

    fn recorder(log: &Arc<Mutex<Vec<u32>>>, id: u32) -> TimeoutCallback {
        let log = log.clone();
        Box::new(move || log.lock().unwrap().push(id))
    }

    #[test]
    fn test_add_orders_by_deadline() {
        let mut timers = TimerHeap::new();
        timers.add(1u32, Duration::from_secs(30), noop());
        timers.add(2, Duration::from_secs(10), noop());
        timers.add(3, Duration::from_secs(20), noop());
        timers.assert_heap_property();

        assert_eq!(timers.pop(), Some(2));
        assert_eq!(timers.pop(), Some(3));
        assert_eq!(timers.pop(), Some(1));
        assert_eq!(timers.pop(), None);
    }

    #[test]
    fn test_add_existing_replaces_deadline_and_callback() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut timers = TimerHeap::new();
        timers.add(7u32, Duration::from_secs(60), recorder(&log, 100));
        timers.add(7, Duration::ZERO, recorder(&log, 200));
        assert_eq!(timers.len(), 1);

        assert_eq!(timers.tick(), 1);
        assert_eq!(*log.lock().unwrap(), vec![200]);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_tick_fires_only_expired() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut timers = TimerHeap::new();
        timers.add(1u32, Duration::ZERO, recorder(&log, 1));
        timers.add(2, Duration::from_secs(60), recorder(&log, 2));
        timers.add(3, Duration::ZERO, recorder(&log, 3));

        assert_eq!(timers.tick(), 2);
        let mut fired = log.lock().unwrap().clone();
        fired.sort();
        assert_eq!(fired, vec![1, 3]);
        assert!(timers.contains(2));
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_next_tick() {
        let mut timers: TimerHeap<u32> = TimerHeap::new();
        assert_eq!(timers.next_tick(), None);

        timers.add(1, Duration::from_millis(500), noop());
        let wait = timers.next_tick().unwrap();
        assert!(wait <= Duration::from_millis(500));
        assert!(wait > Duration::from_millis(400));

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        timers.add(
            2,
            Duration::ZERO,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        // Overdue entries are evicted before the remaining wait is reported.
        assert!(timers.next_tick().unwrap() > Duration::ZERO);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_adjust_and_remove() {
        let mut timers = TimerHeap::new();
        timers.add(1u32, Duration::from_secs(1), noop());
        timers.add(2, Duration::from_secs(2), noop());
        timers.add(3, Duration::from_secs(3), noop());

        assert!(timers.adjust(1, Duration::from_secs(10)));
        timers.assert_heap_property();
        assert_eq!(timers.pop(), Some(2));

        assert!(timers.remove(3));
        assert!(!timers.remove(3));
        assert!(!timers.adjust(42, Duration::from_secs(1)));
        assert_eq!(timers.pop(), Some(1));
    }

    #[test]
    fn test_fire_runs_callback_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut timers = TimerHeap::new();
        timers.add(5u32, Duration::from_secs(60), recorder(&log, 5));
        assert!(timers.fire(5));
        assert!(!timers.fire(5));
        assert_eq!(*log.lock().unwrap(), vec![5]);
    }

    #[test]
    fn test_multi_level_sift_down() {
        // A root pushed far into the future must sink through every level,
        // not just the first.
        let mut timers = TimerHeap::new();
        for id in 0..31u32 {
            timers.add(id, Duration::from_secs(100 + id as u64), noop());
        }
        assert!(timers.adjust(0, Duration::from_secs(10_000)));
        timers.assert_heap_property();

        let mut order = Vec::new();
        while let Some(id) = timers.pop() {
            order.push(id);
        }
        let mut expected: Vec<u32> = (1..31).collect();
        expected.push(0);
        assert_eq!(order, expected);
    }

    #[test]
    fn test_randomized_operations_keep_heap_property() {
        let mut state = 0x2545_F491_4F6C_DD1Du64;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        let mut timers = TimerHeap::new();
        for _ in 0..5_000 {
            let id = (next() % 128) as u32;
            let secs = Duration::from_millis(1_000 + next() % 100_000);
            match next() % 4 {
                0 | 1 => timers.add(id, secs, noop()),
                2 => {
                    timers.adjust(id, secs);
                }
                _ => {
                    if next() % 2 == 0 {
                        timers.pop();
                    } else {
                        timers.remove(id);
                    }
                }
            }
            timers.assert_heap_property();
        }

        let mut last = None;
        while let Some(deadline) = timers.peek_deadline() {
            if let Some(prev) = last {
                assert!(prev <= deadline);
            }
            last = Some(deadline);
            timers.pop();
        }
    }
}
