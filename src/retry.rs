/// Bounded retry with exponential backoff and jitter.
///
/// `RetryPolicy` knows nothing about HTTP or SQL: the caller supplies the
/// operation and a classifier that decides, per error, whether another
/// attempt is worthwhile and whether the server asked for a specific delay.
/// The fetcher wraps its GET with it; the loader wraps each upsert.

use rand::Rng;
use std::time::Duration;
use tracing::warn;

use crate::config::RetryConfig;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Transient failure: back off and try again.
    Retry,
    /// Transient failure with a server-provided delay (e.g. `Retry-After`).
    RetryAfter(Duration),
    /// Permanent failure: stop now.
    Abort,
}

/// Why `RetryPolicy::run` gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The classifier said the error is permanent.
    Aborted { attempts: u32, error: E },
    /// Every attempt failed with a transient error.
    Exhausted { attempts: u32, error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Aborted { attempts, .. } | RetryError::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Aborted { error, .. } | RetryError::Exhausted { error, .. } => error,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Always at least 1.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each attempt after that.
    pub base_delay: Duration,
    /// Upper bound for the computed exponential delay.
    pub max_delay: Duration,
    /// Random extra delay in `[0, jitter]` added to every computed delay.
    pub jitter: Duration,
    /// Upper bound for server-provided delays.
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
            max_retry_after: Duration::from_secs(60),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: Duration::from_millis(config.jitter_ms),
            max_retry_after: Duration::from_secs(config.max_retry_after_secs),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before attempt `attempt + 1`, given that `attempt` (1-based)
    /// just failed, without jitter: `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn delay_for(&self, attempt: u32, decision: RetryDecision) -> Duration {
        match decision {
            RetryDecision::RetryAfter(hint) => hint.min(self.max_retry_after),
            _ => self.backoff(attempt) + self.sample_jitter(),
        }
    }

    fn sample_jitter(&self) -> Duration {
        let max_ms = self.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    /// Runs `op` until it succeeds, the classifier aborts, or the attempt
    /// budget is spent, sleeping the calling thread between attempts.
    ///
    /// `op` receives the 1-based attempt number.
    pub fn run<T, E, Op, Classify>(&self, op: Op, classify: Classify) -> Result<T, RetryError<E>>
    where
        Op: FnMut(u32) -> Result<T, E>,
        Classify: Fn(&E) -> RetryDecision,
    {
        self.run_with_sleep(op, classify, std::thread::sleep)
    }

    /// Same as [`RetryPolicy::run`] with an injectable sleep.
    pub fn run_with_sleep<T, E, Op, Classify, Sleep>(
        &self,
        mut op: Op,
        classify: Classify,
        mut sleep: Sleep,
    ) -> Result<T, RetryError<E>>
    where
        Op: FnMut(u32) -> Result<T, E>,
        Classify: Fn(&E) -> RetryDecision,
        Sleep: FnMut(Duration),
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let error = match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let decision = classify(&error);
            if decision == RetryDecision::Abort {
                return Err(RetryError::Aborted {
                    attempts: attempt,
                    error,
                });
            }
            if attempt >= max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    error,
                });
            }

            let delay = self.delay_for(attempt, decision);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "transient failure, backing off"
            );
            sleep(delay);
            attempt += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            jitter: Duration::ZERO,
            max_retry_after: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy(10);
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(400));
        assert_eq!(p.backoff(4), Duration::from_millis(800));
        assert_eq!(p.backoff(5), Duration::from_millis(1_000));
        assert_eq!(p.backoff(40), Duration::from_millis(1_000));
    }

    #[test]
    fn test_succeeds_after_two_transient_failures_with_two_delays() {
        let mut sleeps = Vec::new();
        let result: Result<&str, RetryError<&str>> = policy(5).run_with_sleep(
            |attempt| if attempt < 3 { Err("503") } else { Ok("body") },
            |_| RetryDecision::Retry,
            |d| sleeps.push(d),
        );

        assert_eq!(result.unwrap(), "body");
        assert_eq!(
            sleeps,
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[test]
    fn test_abort_stops_without_sleeping() {
        let mut sleeps = 0;
        let mut calls = 0;
        let result: Result<(), RetryError<&str>> = policy(5).run_with_sleep(
            |_| {
                calls += 1;
                Err("404")
            },
            |_| RetryDecision::Abort,
            |_| sleeps += 1,
        );

        let err = result.unwrap_err();
        assert!(!err.is_exhausted());
        assert_eq!(err.attempts(), 1);
        assert_eq!(calls, 1);
        assert_eq!(sleeps, 0);
    }

    #[test]
    fn test_exhaustion_reports_attempt_count_and_last_error() {
        let mut sleeps = 0;
        let result: Result<(), RetryError<u32>> = policy(3).run_with_sleep(
            Err,
            |_| RetryDecision::Retry,
            |_| sleeps += 1,
        );

        let err = result.unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(err.attempts(), 3);
        assert_eq!(err.into_inner(), 3, "last error should come from attempt 3");
        assert_eq!(sleeps, 2, "no sleep after the final attempt");
    }

    #[test]
    fn test_retry_after_hint_overrides_backoff_and_is_capped() {
        let mut sleeps = Vec::new();
        let _: Result<(), RetryError<()>> = policy(3).run_with_sleep(
            |_| Err(()),
            |_| RetryDecision::RetryAfter(Duration::from_secs(120)),
            |d| sleeps.push(d),
        );
        assert_eq!(sleeps, vec![Duration::from_secs(5), Duration::from_secs(5)]);

        let mut sleeps = Vec::new();
        let _: Result<(), RetryError<()>> = policy(2).run_with_sleep(
            |_| Err(()),
            |_| RetryDecision::RetryAfter(Duration::from_secs(2)),
            |d| sleeps.push(d),
        );
        assert_eq!(sleeps, vec![Duration::from_secs(2)]);
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let p = RetryPolicy {
            jitter: Duration::from_millis(50),
            ..policy(2)
        };
        for _ in 0..100 {
            let d = p.delay_for(1, RetryDecision::Retry);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let mut calls = 0;
        let result: Result<(), RetryError<()>> = policy(0).run_with_sleep(
            |_| {
                calls += 1;
                Err(())
            },
            |_| RetryDecision::Retry,
            |_| {},
        );
        assert!(result.unwrap_err().is_exhausted());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_policy_from_config() {
        let config = RetryConfig {
            max_attempts: 0,
            base_delay_ms: 250,
            max_delay_ms: 4_000,
            jitter_ms: 10,
            max_retry_after_secs: 30,
        };
        let p = RetryPolicy::from(&config);
        assert_eq!(p.max_attempts, 1);
        assert_eq!(p.base_delay, Duration::from_millis(250));
        assert_eq!(p.max_retry_after, Duration::from_secs(30));
    }
}
