//! Monotonic id counter used for request ids, subscription keys and
//! connection ids.
//!
//! # Why a counter and not random ids?
//!
//! MOO replies are matched to requests purely by the `Request-Id` header.  A
//! counter guarantees that an id is never reused for the lifetime of the
//! counter, so a late reply for an old request can never be mistaken for a
//! reply to a new one.
//!
//! The counter uses an `AtomicU64` so a single `static` instance can hand out
//! process-wide ids (connection ids) while per-connection instances hand out
//! request ids without any locking.

use std::sync::atomic::{AtomicU64, Ordering};

/// A thread-safe, monotonically increasing id source.
///
/// Ids start at 0 and increment by 1 with each call to [`next`](Self::next).
///
/// # Examples
///
/// ```rust
/// use moo_core::protocol::SequenceCounter;
///
/// let counter = SequenceCounter::new();
/// assert_eq!(counter.next(), 0);
/// assert_eq!(counter.next(), 1);
/// assert_eq!(counter.next_id(), "2");
/// ```
#[derive(Debug)]
pub struct SequenceCounter {
    inner: AtomicU64,
}

impl SequenceCounter {
    /// Creates a new counter starting at 0.
    ///
    /// `const` so it can back a `static`.
    pub const fn new() -> Self {
        Self {
            inner: AtomicU64::new(0),
        }
    }

    /// Returns the next value and advances the counter.
    ///
    /// Wraps from `u64::MAX` to 0 without panicking.
    pub fn next(&self) -> u64 {
        // Relaxed: ids only need uniqueness, not cross-thread ordering.
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the next value rendered as a decimal string, the form MOO puts
    /// on the wire.
    pub fn next_id(&self) -> String {
        self.next().to_string()
    }

    /// Returns the value the next call to [`next`](Self::next) will hand out.
    pub fn current(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}
