//! Retry logic with exponential backoff for remote requests.
//!
//! Every request the engine makes (listing pages, asset bytes) goes through
//! [`RetryPolicy::run`]. Transient failures (rate limiting, 5xx, dropped
//! connections, truncated bodies) are retried locally; anything else is
//! handed back immediately so the caller can decide (re-authenticate, abort).
//!
//! # Retry Strategy
//!
//! ```text
//! delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..=jitter)
//! ```
//!
//! A `Retry-After` hint from a 429 response raises the delay to the hinted
//! value, still capped at `max_delay`.

use crate::error::{Error, RemoteError};
use rand::{Rng, rng};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{error, warn};

/// A request that failed for good, with the number of attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exhausted {
    pub error: RemoteError,
    pub attempts: u32,
}

impl Exhausted {
    pub fn into_error(self, what: impl Into<String>) -> Error {
        match self.error {
            RemoteError::Unauthorized => {
                Error::Authentication(format!("{} was rejected: session not accepted", what.into()))
            }
            source => Error::Fetch {
                what: what.into(),
                attempts: self.attempts,
                source,
            },
        }
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt before giving up.
    pub max_retries: u32,
    /// Initial delay between retries (doubles with each attempt).
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Upper bound of the random jitter added to each delay.
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// No waiting between retries; for tests.
    #[cfg(test)]
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32, error: &RemoteError) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        let mut delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if let RemoteError::RateLimited {
            retry_after: Some(hint),
        } = error
        {
            delay = delay.max((*hint).min(self.max_delay));
        }
        let jitter_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms > 0 {
            delay += Duration::from_millis(rng().random_range(0..=jitter_ms));
        }
        delay
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// retry budget is spent.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, Exhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let total_t0 = Instant::now();
        let mut attempt = 0u32;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    let total_dt = total_t0.elapsed();

                    if !e.is_transient() {
                        return Err(Exhausted {
                            error: e,
                            attempts: attempt,
                        });
                    }
                    if attempt > self.max_retries {
                        error!(
                            what,
                            attempt,
                            max = self.max_retries,
                            elapsed_ms_total = total_dt.as_millis() as u64,
                            error = %e,
                            "request exhausted retries"
                        );
                        return Err(Exhausted {
                            error: e,
                            attempts: attempt,
                        });
                    }

                    let delay = self.delay_for(attempt, &e);
                    warn!(
                        what,
                        attempt,
                        max = self.max_retries,
                        elapsed_ms_total = total_dt.as_millis() as u64,
                        ?delay,
                        error = %e,
                        "request failed; backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::ZERO,
        };
        let e = RemoteError::Status(503);
        assert_eq!(policy.delay_for(1, &e), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2, &e), Duration::from_secs(2));
        assert_eq!(policy.delay_for(5, &e), Duration::from_secs(16));
        assert_eq!(policy.delay_for(6, &e), Duration::from_secs(30));
        assert_eq!(policy.delay_for(40, &e), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_after_hint_is_honoured_but_capped() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_jitter: Duration::ZERO,
        };
        let hinted = RemoteError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(policy.delay_for(1, &hinted), Duration::from_secs(7));
        let greedy = RemoteError::RateLimited {
            retry_after: Some(Duration::from_secs(600)),
        };
        assert_eq!(policy.delay_for(1, &greedy), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_jitter: Duration::from_millis(250),
        };
        for _ in 0..50 {
            let d = policy.delay_for(1, &RemoteError::Transport("x".into()));
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(350));
        }
    }

    #[tokio::test]
    async fn test_run_retries_transient_then_succeeds() {
        let calls = Cell::new(0);
        let result = RetryPolicy::immediate(3)
            .run("page", || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move {
                    if n < 3 {
                        Err(RemoteError::Status(502))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_run_gives_up_after_budget() {
        let calls = Cell::new(0);
        let result: Result<(), _> = RetryPolicy::immediate(2)
            .run("page", || {
                calls.set(calls.get() + 1);
                async { Err(RemoteError::Transport("reset".into())) }
            })
            .await;
        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 3);
        assert_eq!(calls.get(), 3);
        assert!(matches!(
            exhausted.into_error("page 1"),
            Error::Fetch { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_run_does_not_retry_permanent_errors() {
        let calls = Cell::new(0);
        let result: Result<(), _> = RetryPolicy::immediate(5)
            .run("asset", || {
                calls.set(calls.get() + 1);
                async { Err(RemoteError::Unauthorized) }
            })
            .await;
        assert_eq!(calls.get(), 1);
        assert!(matches!(
            result.unwrap_err().into_error("asset"),
            Error::Authentication(_)
        ));
    }
}
