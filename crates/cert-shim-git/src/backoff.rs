//! Retry timing as plain calculations.
//!
//! Nothing in here sleeps or spawns; callers ask for a delay and decide what
//! to do with it. The same calculator drives the sync conflict retry and the
//! per-item backoff of the reconciliation queue.

use std::time::Duration;

use crate::error::GitError;

/// `base * factor^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl ExponentialBackoff {
    pub const fn new(base: Duration, factor: f64, max: Duration) -> Self {
        ExponentialBackoff { base, factor, max }
    }

    /// Delay to wait after the `attempt`-th failure (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Bounded retry for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub backoff: ExponentialBackoff,
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    /// 4 attempts, 10ms initial delay, factor 5.
    fn default() -> Self {
        RetryPolicy {
            backoff: ExponentialBackoff::new(
                Duration::from_millis(10),
                5.0,
                Duration::from_secs(10),
            ),
            max_attempts: 4,
        }
    }
}

impl RetryPolicy {
    /// Whether attempt `attempt` (0-based) failing with `err` earns another try.
    pub fn should_retry(&self, attempt: u32, err: &GitError) -> bool {
        attempt.saturating_add(1) < self.max_attempts && err.is_retryable()
    }

    /// Delay before the attempt following `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conflict() -> GitError {
        GitError::CommandFailed {
            command: "git push".to_string(),
            code: 1,
            stderr: "error: failed to push some refs to 'origin'".to_string(),
        }
    }

    #[test]
    fn default_policy_delays() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay(0), Duration::from_millis(10));
        assert_eq!(p.delay(1), Duration::from_millis(50));
        assert_eq!(p.delay(2), Duration::from_millis(250));
    }

    #[test]
    fn queue_style_backoff_doubles_and_caps() {
        let b = ExponentialBackoff::new(Duration::from_secs(30), 2.0, Duration::from_secs(600));
        let delays: Vec<u64> = (0..7).map(|n| b.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![30, 60, 120, 240, 480, 600, 600]);
        assert_eq!(b.delay(u32::MAX), Duration::from_secs(600));
    }

    #[test]
    fn retries_conflicts_until_bound() {
        let p = RetryPolicy::default();
        let err = conflict();
        assert!(p.should_retry(0, &err));
        assert!(p.should_retry(2, &err));
        assert!(!p.should_retry(3, &err));
    }

    #[test]
    fn never_retries_fatal_errors() {
        let p = RetryPolicy::default();
        assert!(!p.should_retry(0, &GitError::WriteNotAllowed));
    }
}
