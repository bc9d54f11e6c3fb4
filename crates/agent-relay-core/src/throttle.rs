//! Bounded-rate flushing of streamed deltas to the rendering layer.

use std::time::{Duration, Instant};

/// Characters that force an unconditional flush: a sentence or line
/// boundary reads badly when held back.
const BOUNDARY_CHARS: &[char] = &['\n', '.', '!', '?'];

/// Decides when batched delta appends should be pushed to the renderer.
///
/// Pure decision logic; the caller owns the timer. Appends are batched to
/// at most one notification per `interval`, with an immediate flush when
/// the delta contains a boundary character.
#[derive(Debug)]
pub struct DeltaThrottle {
    interval: Duration,
    last_flush: Option<Instant>,
    pending: bool,
}

impl DeltaThrottle {
    /// Create a throttle with the given minimum flush interval.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_flush: None,
            pending: false,
        }
    }

    /// Offer a delta at time `now`. Returns `true` when the caller should
    /// flush immediately.
    pub fn offer(&mut self, now: Instant, delta: &str) -> bool {
        self.pending = true;
        let boundary = delta.contains(BOUNDARY_CHARS);
        let due = self
            .last_flush
            .is_none_or(|last| now.duration_since(last) >= self.interval);
        if boundary || due {
            self.mark_flushed(now);
            return true;
        }
        false
    }

    /// Whether a batched delta is still waiting to be flushed.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending
    }

    /// Drain any batched delta (connection close, stream end).
    ///
    /// Returns `true` when a flush is owed.
    pub fn drain(&mut self, now: Instant) -> bool {
        if self.pending {
            self.mark_flushed(now);
            return true;
        }
        false
    }

    fn mark_flushed(&mut self, now: Instant) {
        self.last_flush = Some(now);
        self.pending = false;
    }
}
