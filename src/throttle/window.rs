//! Trailing-window send accounting

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Send timestamps inside the trailing `period`
///
/// A send recorded at `t` counts against the window until `t + period`.
#[derive(Debug, Clone)]
pub struct ThrottleWindow {
    period: Duration,
    allowed: usize,
    sent: VecDeque<Instant>,
}

impl ThrottleWindow {
    pub fn new(allowed: usize, period: Duration) -> Self {
        Self {
            period,
            allowed,
            sent: VecDeque::with_capacity(allowed),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn allowed(&self) -> usize {
        self.allowed
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.sent.front() {
            if oldest + self.period <= now {
                self.sent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Sends counted against the window at `now`
    pub fn sent_in_window(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.sent.len()
    }

    pub fn has_capacity(&mut self, now: Instant) -> bool {
        self.sent_in_window(now) < self.allowed
    }

    pub fn record(&mut self, at: Instant) {
        self.sent.push_back(at);
    }

    /// When the next slot frees up, or `None` if one is free now
    pub fn next_slot(&mut self, now: Instant) -> Option<Instant> {
        if self.has_capacity(now) {
            return None;
        }
        // Full window means at least `allowed` entries; the one that must
        // expire is `allowed` places from the back
        let index = self.sent.len().saturating_sub(self.allowed);
        self.sent.get(index).map(|&at| at + self.period)
    }
}
