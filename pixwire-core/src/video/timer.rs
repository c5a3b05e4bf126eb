//! Deadline timers for the capture and encode contexts.
//!
//! A min-heap ordered by deadline. Cancelling a timer removes its payload
//! and leaves a stale heap entry behind, which is skipped lazily when it
//! reaches the top.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

/// Identifies a scheduled timer. Invalid once fired or cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

/// Min-heap of `(deadline, payload)` pairs.
#[derive(Debug)]
pub struct TimerQueue<T> {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, T>,
    next_id: u64,
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            next_id: 0,
        }
    }

    /// Schedule `value` to fire at `deadline`.
    pub fn schedule(&mut self, deadline: Instant, value: T) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((deadline, id)));
        self.entries.insert(id, value);
        TimerHandle(id)
    }

    /// Cancel a timer, returning its payload if it was still pending.
    pub fn cancel(&mut self, handle: TimerHandle) -> Option<T> {
        self.entries.remove(&handle.0)
    }

    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.entries.contains_key(&handle.0)
    }

    /// Earliest live deadline.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.discard_stale();
        self.heap.peek().map(|Reverse((at, _))| *at)
    }

    /// Pop one timer whose deadline is at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerHandle, T)> {
        self.discard_stale();
        let Reverse((at, id)) = *self.heap.peek()?;
        if at > now {
            return None;
        }
        self.heap.pop();
        self.entries.remove(&id).map(|v| (TimerHandle(id), v))
    }

    /// Pop every due timer, in deadline order.
    pub fn drain_due(&mut self, now: Instant) -> Vec<T> {
        let mut out = Vec::new();
        while let Some((_, v)) = self.pop_due(now) {
            out.push(v);
        }
        out
    }

    /// Number of live timers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.entries.clear();
    }

    fn discard_stale(&mut self) {
        while let Some(Reverse((_, id))) = self.heap.peek() {
            if self.entries.contains_key(id) {
                break;
            }
            self.heap.pop();
        }
    }
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fires_in_deadline_order() {
        let t0 = Instant::now();
        let mut q = TimerQueue::new();
        q.schedule(t0 + Duration::from_millis(30), "c");
        q.schedule(t0 + Duration::from_millis(10), "a");
        q.schedule(t0 + Duration::from_millis(20), "b");
        assert_eq!(q.next_deadline(), Some(t0 + Duration::from_millis(10)));
        assert_eq!(q.drain_due(t0 + Duration::from_millis(25)), vec!["a", "b"]);
        assert_eq!(q.len(), 1);
        assert!(q.pop_due(t0 + Duration::from_millis(29)).is_none());
    }

    #[test]
    fn cancel_invalidates_handle() {
        let t0 = Instant::now();
        let mut q = TimerQueue::new();
        let h = q.schedule(t0, 1);
        let later = q.schedule(t0 + Duration::from_secs(1), 2);
        assert!(q.is_pending(h));
        assert_eq!(q.cancel(h), Some(1));
        assert!(!q.is_pending(h));
        assert_eq!(q.cancel(h), None);
        assert_eq!(q.next_deadline(), Some(t0 + Duration::from_secs(1)));
        assert!(q.pop_due(t0).is_none());
        assert_eq!(q.pop_due(t0 + Duration::from_secs(2)).map(|(h, v)| (h, v)), Some((later, 2)));
        assert!(q.is_empty());
    }
}
