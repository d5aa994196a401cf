//! Retry with exponential backoff, bounded by elapsed wall-clock time

use std::{
    fmt::Display,
    future::Future,
    time::{Duration, Instant},
};

use rand::Rng;
use tracing::warn;

use crate::constants::{DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF, DEFAULT_RETRY_BUDGET};

/// Errors that can tell whether retrying may succeed
pub trait Retryable {
    /// Whether the failure is expected to clear on its own
    fn is_transient(&self) -> bool;
}

/// The schedule and budget for retrying a network call.
///
/// Counters (attempt number, elapsed time) live only for the duration of one
/// wrapped call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The backoff before the first retry
    pub initial_backoff: Duration,
    /// The upper bound on a single backoff
    pub max_backoff: Duration,
    /// The total wall-clock time a call may spend retrying
    pub budget: Duration,
    /// Whether to randomize each backoff downwards by up to half
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            budget: DEFAULT_RETRY_BUDGET,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that sleeps the same amount between every attempt
    pub fn fixed(backoff: Duration, budget: Duration) -> Self {
        Self {
            initial_backoff: backoff,
            max_backoff: backoff,
            budget,
            jitter: false,
        }
    }

    /// The same schedule with a different budget
    pub fn with_budget(&self, budget: Duration) -> Self {
        Self {
            budget,
            ..self.clone()
        }
    }

    /// The backoff to sleep after the given (zero-indexed) attempt fails
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let backoff = self
            .initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff);

        if self.jitter {
            backoff.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            backoff
        }
    }

    /// Run `action` until it succeeds, fails terminally, or exhausts the budget
    pub async fn run<T, E, F, Fut>(&self, operation: &str, action: F) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_from(operation, 0, action).await
    }

    /// Run `action` with the backoff schedule starting at `attempt`.
    ///
    /// Terminal errors propagate immediately. A call that exhausts its budget
    /// returns the last transient error it saw.
    pub async fn run_from<T, E, F, Fut>(
        &self,
        operation: &str,
        mut attempt: u32,
        mut action: F,
    ) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let start = Instant::now();
        loop {
            let err = match action().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => err,
            };

            let backoff = self.backoff(attempt);
            let elapsed = start.elapsed();
            if elapsed + backoff > self.budget {
                warn!(
                    operation,
                    attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    cause = %err,
                    "retry budget exhausted"
                );
                return Err(err);
            }

            warn!(
                operation,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                cause = %err,
                "transient failure, retrying"
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::{Duration, Instant},
    };

    use crate::network::{ClientError, TransientKind};

    use super::RetryPolicy;

    fn timeout() -> ClientError {
        ClientError::transient(TransientKind::Timeout, "request timed out")
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let policy = RetryPolicy::fixed(Duration::from_millis(1), Duration::from_secs(5));
        let calls = AtomicUsize::new(0);

        let res: Result<u64, ClientError> = policy
            .run("flaky", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(timeout())
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(res, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_terminal_failures_propagate_immediately() {
        let policy = RetryPolicy::fixed(Duration::from_millis(1), Duration::from_secs(5));
        let calls = AtomicUsize::new(0);

        let res: Result<(), ClientError> = policy
            .run("revert", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ClientError::revert("Unauthorized()"))
            })
            .await;

        assert!(matches!(res, Err(ClientError::Revert { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_is_respected() {
        let budget = Duration::from_millis(100);
        let policy = RetryPolicy::fixed(Duration::from_millis(10), budget);
        let calls = AtomicUsize::new(0);

        let start = Instant::now();
        let res: Result<(), ClientError> = policy
            .run("always-fails", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(ClientError::transient(
                    TransientKind::RateLimited,
                    format!("attempt {n}"),
                ))
            })
            .await;
        let elapsed = start.elapsed();

        // The last transient error surfaces, not a generic timeout
        let n = calls.load(Ordering::SeqCst);
        assert_eq!(
            res,
            Err(ClientError::transient(
                TransientKind::RateLimited,
                format!("attempt {}", n - 1)
            ))
        );
        assert!(n > 1);
        assert!(elapsed < budget * 5, "took {elapsed:?}");
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            budget: Duration::from_secs(10),
            jitter: false,
        };

        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::fixed(Duration::from_millis(100), Duration::from_secs(1))
        };

        for attempt in 0..20 {
            let backoff = policy.backoff(attempt);
            assert!(backoff >= Duration::from_millis(50) && backoff <= Duration::from_millis(100));
        }
    }
}
