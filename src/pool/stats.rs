//! Point-in-time pool statistics.

use std::collections::VecDeque;

const RESPONSE_TIME_WINDOW: usize = 100;

/// Snapshot of pool state at the moment [`Pool::stats`](crate::pool::Pool::stats) was called.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Connections currently checked out (base + overflow).
    pub active: usize,
    /// Base connections sitting idle, ready for checkout.
    pub idle: usize,
    /// Overflow connections currently checked out.
    pub overflow: usize,
    pub total_checkouts: u64,
    pub total_checkins: u64,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    /// Response times (ms) from the rolling window of the last 100 checkins,
    /// oldest first.
    pub response_times_ms: Vec<u64>,
}

/// Rolling window of the last [`RESPONSE_TIME_WINDOW`] checkin durations.
pub(crate) struct ResponseTimeWindow {
    buf: VecDeque<u64>,
}

impl ResponseTimeWindow {
    pub(crate) fn new() -> Self {
        Self {
            buf: VecDeque::with_capacity(RESPONSE_TIME_WINDOW),
        }
    }

    pub(crate) fn push(&mut self, millis: u64) {
        if self.buf.len() == RESPONSE_TIME_WINDOW {
            self.buf.pop_front();
        }
        self.buf.push_back(millis);
    }

    pub(crate) fn snapshot(&self) -> Vec<u64> {
        self.buf.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_caps_at_100() {
        let mut window = ResponseTimeWindow::new();
        for i in 0..150u64 {
            window.push(i);
        }
        let snapshot = window.snapshot();
        assert_eq!(snapshot.len(), 100);
        assert_eq!(snapshot[0], 50);
        assert_eq!(snapshot[99], 149);
    }
}
