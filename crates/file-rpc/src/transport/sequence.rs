//! Correlation id allocation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Largest id the sender hands out (`2^53 - 1`), so ids stay exact in peers
/// that store them as doubles.
pub const MAX_SEQUENCE_ID: u64 = (1 << 53) - 1;

/// Monotonic id source that wraps to `0` after [`MAX_SEQUENCE_ID`].
///
/// The counter knows nothing about which ids are still in use; the
/// dispatcher refuses ids that are pending and the caller simply draws
/// again.
#[derive(Debug)]
pub struct SequenceCounter {
    next: AtomicU64,
}

impl SequenceCounter {
    /// Counter whose first id is `1`.
    #[must_use]
    pub const fn new() -> Self {
        Self::starting_at(1)
    }

    /// Counter whose first id is `start` (values above the range wrap to `0`).
    #[must_use]
    pub const fn starting_at(start: u64) -> Self {
        let start = if start > MAX_SEQUENCE_ID { 0 } else { start };
        Self {
            next: AtomicU64::new(start),
        }
    }

    /// Take the next id.
    pub fn next(&self) -> u64 {
        let previous = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
                Some(if id >= MAX_SEQUENCE_ID { 0 } else { id + 1 })
            });

        match previous {
            Ok(id) | Err(id) => id,
        }
    }

    /// The id the next call to [`next`](Self::next) will return.
    #[must_use]
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}
