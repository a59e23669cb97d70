//! Exponential backoff for transient session errors

use log::warn;
use std::time::Duration;

use crate::error::SessionError;

/// How often and how patiently transient failures are retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included. Always at least 1.
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub initial_backoff: Duration,
    /// Upper bound for any single delay, jitter excluded
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// One attempt, no waiting
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay to wait after attempt number `attempt` (1-based) failed.
    ///
    /// Doubles with each attempt, is capped at `max_backoff` and gets up to
    /// 50% random jitter on top.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .initial_backoff
            .saturating_mul(1 << exponent)
            .min(self.max_backoff);

        let jitter_ms = (delay.as_millis() / 2) as u64;
        delay + Duration::from_millis(rand_jitter(jitter_ms))
    }

    /// Call `op` until it succeeds, fails with a non-transient error, or
    /// runs out of attempts. `op` receives the 1-based attempt number.
    ///
    /// Nothing is held while sleeping; callers lease sessions inside `op`.
    pub fn retry<T>(
        &self,
        what: &str,
        mut op: impl FnMut(u32) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        what, attempt, max_attempts, e, delay
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Random value in `0..=max`
fn rand_jitter(max: u64) -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    if max == 0 {
        return 0;
    }
    let hasher = RandomState::new().build_hasher();
    hasher.finish() % (max + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
        };

        let first = policy.backoff(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
        let second = policy.backoff(2);
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(300));
        let capped = policy.backoff(9);
        assert!(capped >= Duration::from_millis(300) && capped <= Duration::from_millis(450));
    }

    #[test]
    fn test_no_backoff_without_delay() {
        assert_eq!(RetryPolicy::none().backoff(3), Duration::ZERO);
    }

    #[test]
    fn test_retry_recovers_from_transient_errors() {
        let mut calls = 0;
        let result = fast(3).retry("search", |attempt| {
            calls += 1;
            if attempt < 3 {
                Err(SessionError::ServerBusy("try later".into()))
            } else {
                Ok(attempt)
            }
        });

        assert_eq!(result, Ok(3));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_gives_up_after_max_attempts() {
        let mut calls = 0;
        let result: Result<(), _> = fast(2).retry("fetch", |_| {
            calls += 1;
            Err(SessionError::Timeout("slow".into()))
        });

        assert_eq!(result, Err(SessionError::Timeout("slow".into())));
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_permanent_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = fast(5).retry("move", |_| {
            calls += 1;
            Err(SessionError::Rejected("NO".into()))
        });

        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
