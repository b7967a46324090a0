//! Reconnection policy contract and the pattern-backoff implementation
//!
//! The lifecycle core only talks to [`ReconnectPolicy`]; it never inspects
//! attempt counters directly.

use crate::config::ReconnectSettings;
use std::time::Duration;

/// How much of the schedule to clear before an open cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// Caller-initiated open: forget everything
    Fresh,
    /// Watchdog-initiated reconnect: policy decides what to keep
    Reconnect,
}

/// Stateful backoff schedule consulted by the open loop
pub trait ReconnectPolicy: Send + Sync {
    /// Reset the schedule before an open cycle
    fn reset(&mut self, mode: ResetMode);

    /// Whether the attempt ceiling has been reached
    fn attempts_exhausted(&self) -> bool;

    /// Delay to wait before the next attempt
    fn next_interval(&self) -> Duration;

    /// Record that an attempt was made
    fn advance(&mut self);

    /// Attempts made in the current cycle
    fn attempts_made(&self) -> u32;
}

/// Custom backoff pattern with a sustained delay and optional attempt ceiling
///
/// Pattern `25ms, 50ms, 100ms, 250ms` then 250ms forever is the default.
/// Every watchdog-driven reconnect cycle starts one step further into the
/// pattern, so a link that keeps flapping backs off harder; a fresh open
/// starts from the first step again.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    settings: ReconnectSettings,
    attempts: u32,
    reconnect_cycles: u32,
}

impl BackoffPolicy {
    pub fn new(settings: ReconnectSettings) -> Self {
        Self {
            settings,
            attempts: 0,
            reconnect_cycles: 0,
        }
    }

    /// Policy that never waits and allows `max_attempts` attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(ReconnectSettings {
            max_attempts: Some(max_attempts),
            backoff_pattern_ms: Vec::new(),
            sustained_delay_ms: 0,
        })
    }

    /// Backoff delay in milliseconds for a 1-based step
    pub fn calculate_backoff_delay(&self, step: u32) -> u64 {
        let pattern = &self.settings.backoff_pattern_ms;
        let index = step.saturating_sub(1) as usize;
        pattern
            .get(index)
            .copied()
            .unwrap_or(self.settings.sustained_delay_ms)
    }

    /// Upper bound on the total wait across a full cycle (None when unlimited)
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.settings.max_attempts.map(|max_attempts| {
            (1..max_attempts)
                .map(|step| self.calculate_backoff_delay(step))
                .sum()
        })
    }

    pub fn reconnect_cycles(&self) -> u32 {
        self.reconnect_cycles
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(ReconnectSettings::default())
    }
}

impl ReconnectPolicy for BackoffPolicy {
    fn reset(&mut self, mode: ResetMode) {
        self.attempts = 0;
        match mode {
            ResetMode::Fresh => self.reconnect_cycles = 0,
            ResetMode::Reconnect => self.reconnect_cycles = self.reconnect_cycles.saturating_add(1),
        }
    }

    fn attempts_exhausted(&self) -> bool {
        matches!(self.settings.max_attempts, Some(max) if self.attempts >= max)
    }

    fn next_interval(&self) -> Duration {
        // `attempts` is at least 1 whenever a wait happens, since the first
        // attempt of a cycle is never delayed.
        let offset = self
            .reconnect_cycles
            .min(self.settings.backoff_pattern_ms.len() as u32);
        Duration::from_millis(self.calculate_backoff_delay(self.attempts + offset))
    }

    fn advance(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    fn attempts_made(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limited(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy::new(ReconnectSettings {
            max_attempts: Some(max_attempts),
            backoff_pattern_ms: vec![25, 50, 100, 250],
            sustained_delay_ms: 250,
        })
    }

    #[test]
    fn test_calculate_backoff_delay() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.calculate_backoff_delay(1), 25);
        assert_eq!(policy.calculate_backoff_delay(2), 50);
        assert_eq!(policy.calculate_backoff_delay(3), 100);
        assert_eq!(policy.calculate_backoff_delay(4), 250);

        // Sustained delay after pattern exhausted
        assert_eq!(policy.calculate_backoff_delay(5), 250);
        assert_eq!(policy.calculate_backoff_delay(100), 250);
    }

    #[test]
    fn test_empty_pattern_uses_sustained_delay() {
        let policy = BackoffPolicy::new(ReconnectSettings {
            max_attempts: None,
            backoff_pattern_ms: vec![],
            sustained_delay_ms: 75,
        });
        assert_eq!(policy.calculate_backoff_delay(1), 75);
        assert_eq!(policy.calculate_backoff_delay(9), 75);
    }

    #[test]
    fn test_unlimited_never_exhausts() {
        let mut policy = BackoffPolicy::default();
        for _ in 0..1000 {
            policy.advance();
        }
        assert!(!policy.attempts_exhausted());
        assert_eq!(policy.calculate_max_total_time(), None);
    }

    #[test]
    fn test_attempt_ceiling() {
        let mut policy = limited(3);
        policy.reset(ResetMode::Fresh);

        for _ in 0..3 {
            assert!(!policy.attempts_exhausted());
            policy.advance();
        }
        assert!(policy.attempts_exhausted());
        assert_eq!(policy.attempts_made(), 3);
    }

    #[test]
    fn test_interval_follows_pattern() {
        let mut policy = limited(10);
        policy.reset(ResetMode::Fresh);

        policy.advance();
        assert_eq!(policy.next_interval(), Duration::from_millis(25));
        policy.advance();
        assert_eq!(policy.next_interval(), Duration::from_millis(50));
        policy.advance();
        policy.advance();
        policy.advance();
        assert_eq!(policy.next_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_reconnect_reset_starts_further_into_pattern() {
        let mut policy = limited(10);
        policy.reset(ResetMode::Fresh);
        policy.advance();
        policy.advance();

        policy.reset(ResetMode::Reconnect);
        assert_eq!(policy.attempts_made(), 0);
        assert_eq!(policy.reconnect_cycles(), 1);
        policy.advance();
        assert_eq!(policy.next_interval(), Duration::from_millis(50));

        policy.reset(ResetMode::Reconnect);
        policy.advance();
        assert_eq!(policy.next_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_fresh_reset_clears_cycles() {
        let mut policy = limited(10);
        policy.reset(ResetMode::Reconnect);
        policy.reset(ResetMode::Reconnect);
        assert_eq!(policy.reconnect_cycles(), 2);

        policy.reset(ResetMode::Fresh);
        assert_eq!(policy.reconnect_cycles(), 0);
        policy.advance();
        assert_eq!(policy.next_interval(), Duration::from_millis(25));
    }

    #[test]
    fn test_calculate_max_total_time() {
        // Four attempts wait three times: 25 + 50 + 100
        let policy = limited(4);
        assert_eq!(policy.calculate_max_total_time(), Some(175));
    }

    #[test]
    fn test_immediate_policy() {
        let mut policy = BackoffPolicy::immediate(2);
        policy.reset(ResetMode::Fresh);
        policy.advance();
        assert_eq!(policy.next_interval(), Duration::ZERO);
        policy.advance();
        assert!(policy.attempts_exhausted());
    }
}
