use std::collections::VecDeque;
use std::time::Duration;

/// Longest pause taken between jobs.
pub const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(60);

/// Outcomes of the most recent jobs and the pause they currently call for.
///
/// Once the window is full of failures every further failure pauses for the
/// next duration in `rate, 2*rate, 4*rate, ...`, capped at
/// [`MAX_ERROR_BACKOFF`]. A single success anywhere in the window stops the
/// pauses and restarts the sequence from `rate`.
#[derive(Debug, Clone)]
pub struct BackoffState {
    window: VecDeque<bool>,
    capacity: usize,
    rate: Duration,
    next: Duration,
    current: Duration,
}

impl BackoffState {
    pub fn new(capacity: usize, rate: Duration) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            rate,
            next: rate.min(MAX_ERROR_BACKOFF),
            current: Duration::ZERO,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0 && !self.rate.is_zero()
    }

    /// Record one job outcome, returning how long to pause before the next job.
    pub fn record(&mut self, success: bool) -> Option<Duration> {
        if !self.is_enabled() {
            return None;
        }
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(success);

        if self.all_failed() {
            self.current = self.next;
            self.next = self.next.saturating_mul(2).min(MAX_ERROR_BACKOFF);
            Some(self.current)
        } else {
            self.current = Duration::ZERO;
            self.next = self.rate.min(MAX_ERROR_BACKOFF);
            None
        }
    }

    /// Whether every slot of a full window holds a failure.
    pub fn all_failed(&self) -> bool {
        self.window.len() == self.capacity && self.window.iter().all(|ok| !ok)
    }

    /// Pause applied after the most recent job, zero when none was needed.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Number of recorded failures in the window.
    pub fn failures(&self) -> usize {
        self.window.iter().filter(|ok| !**ok).count()
    }
}
