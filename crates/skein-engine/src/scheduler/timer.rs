//! Deadline queue for suspended coroutines and the driver's idle wait.
//!
//! A min-heap ordered by absolute deadline (ties broken by arm order). Entries
//! are cancelled lazily: `cancel` drops the handle from the live set and the
//! stale heap entry is discarded when it surfaces. An entry leaves the live set
//! exactly once, either by firing or by cancellation.

use rustc_hash::FxHashSet;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

/// Handle to an armed deadline
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

impl TimerHandle {
    /// Numeric handle value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Heap entry (min-heap by deadline, then by arm sequence)
struct DeadlineEntry<T> {
    deadline: Instant,
    handle: TimerHandle,
    target: T,
}

impl<T> Ord for DeadlineEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse comparison for min-heap
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.handle.0.cmp(&self.handle.0))
    }
}

impl<T> PartialOrd for DeadlineEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for DeadlineEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl<T> Eq for DeadlineEntry<T> {}

/// Deadline queue keyed by absolute `Instant`.
pub struct DeadlineQueue<T> {
    heap: BinaryHeap<DeadlineEntry<T>>,
    live: FxHashSet<TimerHandle>,
    next_handle: u64,
}

impl<T> DeadlineQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: FxHashSet::default(),
            next_handle: 1,
        }
    }

    /// Arm a deadline for `target`.
    pub fn arm(&mut self, deadline: Instant, target: T) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        self.live.insert(handle);
        self.heap.push(DeadlineEntry {
            deadline,
            handle,
            target,
        });
        handle
    }

    /// Disarm an entry. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        let removed = self.live.remove(&handle);
        if self.live.is_empty() {
            self.heap.clear();
        }
        removed
    }

    /// Whether `handle` is still armed
    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        self.live.contains(&handle)
    }

    /// Nearest live deadline, used to bound the driver's wait.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.discard_stale();
        self.heap.peek().map(|e| e.deadline)
    }

    /// Remove and return every entry due at `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<(TimerHandle, T)> {
        let mut due = Vec::new();
        loop {
            self.discard_stale();
            match self.heap.peek() {
                Some(entry) if entry.deadline <= now => {}
                _ => break,
            }
            if let Some(entry) = self.heap.pop() {
                self.live.remove(&entry.handle);
                due.push((entry.handle, entry.target));
            }
        }
        due
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// True when no entry is armed
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    fn discard_stale(&mut self) {
        while let Some(entry) = self.heap.peek() {
            if self.live.contains(&entry.handle) {
                break;
            }
            self.heap.pop();
        }
    }
}

impl<T> Default for DeadlineQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
