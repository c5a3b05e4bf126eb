//! Damage sequence cancellation shared by the capture and encode contexts.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Every sequence at or below the cancelled mark is dead.
///
/// Sequences start at 1, so a mark of 0 cancels nothing. The mark only
/// moves forward. [`admit`](Self::admit) runs its closure under the same
/// lock as [`cancel`](Self::cancel): once `cancel(n)` returns, no closure
/// for a sequence `<= n` runs.
#[derive(Debug, Default)]
pub struct SequenceGate {
    cancelled: AtomicU64,
    lock: Mutex<()>,
}

impl SequenceGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel everything up to and including `sequence`.
    pub fn cancel(&self, sequence: u64) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.cancelled.fetch_max(sequence, Ordering::AcqRel);
    }

    pub fn is_cancelled(&self, sequence: u64) -> bool {
        sequence <= self.cancelled.load(Ordering::Acquire)
    }

    /// Current cancellation mark.
    pub fn mark(&self) -> u64 {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Run `f` unless `sequence` is cancelled.
    pub fn admit<T>(&self, sequence: u64, f: impl FnOnce() -> T) -> Option<T> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_cancelled(sequence) {
            return None;
        }
        Some(f())
    }
}

// ── Tests ────────────────────────────────────────────────────────
