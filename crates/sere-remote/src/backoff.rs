//! Fibonacci backoff for reconnecting event loops

use std::time::Duration;

/// Fibonacci backoff sequence: base × (1, 1, 2, 3, 5, 8, …), capped
///
/// Used by the sync client's event loops to retry after transport
/// failures without hammering a dead server. `reset` is called after the
/// first successful exchange.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    base: Duration,
    cap: Duration,
    previous: u32,
    current: u32,
}

impl FibonacciBackoff {
    /// Create a backoff with the given base step and cap
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            previous: 0,
            current: 1,
        }
    }

    /// The next delay in the sequence
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.base.saturating_mul(self.current).min(self.cap);
        let next = self.previous.saturating_add(self.current);
        self.previous = self.current;
        self.current = next;
        delay
    }

    /// Restart the sequence after a successful exchange
    pub const fn reset(&mut self) {
        self.previous = 0;
        self.current = 1;
    }
}
