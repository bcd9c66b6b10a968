//! Progress throttling for file transfers.
//!
//! A transfer reports progress at most once per chunk and at most once per
//! interval. The final report (all bytes sent) always goes through.

use std::time::{Duration, Instant};

/// Default minimum gap between progress reports.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Decides which progress updates are worth emitting.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
    last_bytes: u64,
}

impl ProgressThrottle {
    /// Create a throttle with the given interval.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            last_bytes: 0,
        }
    }

    /// Record that `bytes_sent` of `total_bytes` are on the wire.
    ///
    /// Returns true when the caller should emit a progress event.
    pub fn should_emit(&mut self, bytes_sent: u64, total_bytes: u64, now: Instant) -> bool {
        if self.last_emit.is_some() && bytes_sent == self.last_bytes {
            return false;
        }

        let finished = bytes_sent >= total_bytes;
        let due = match self.last_emit {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };

        if finished || due {
            self.last_emit = Some(now);
            self.last_bytes = bytes_sent;
            return true;
        }
        false
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_INTERVAL)
    }
}
