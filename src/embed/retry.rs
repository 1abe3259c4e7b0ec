//! Bounded retry for provider calls
//!
//! Each call moves a [`RetryState`] one step: `Succeeded`, `RetryAfter(delay)` or
//! `GiveUp`. Only retryable errors are retried, with exponential backoff capped at
//! `max_backoff`.

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound on a single call; exceeding it is a retryable failure
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EmbeddingConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            call_timeout: config.timeout(),
        }
    }

    /// Delay before attempt `attempt + 1`, given `attempt` (1-based) just failed
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Outcome of one attempt
#[derive(Debug)]
pub enum Step<T> {
    Succeeded(T),
    RetryAfter {
        next_attempt: u32,
        delay: Duration,
        error: Error,
    },
    GiveUp {
        attempts: u32,
        error: Error,
    },
}

/// Attempt counter driven by call outcomes
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempt: u32,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 1 }
    }

    /// The 1-based attempt about to run
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn advance<T>(&mut self, outcome: Result<T>) -> Step<T> {
        match outcome {
            Ok(value) => Step::Succeeded(value),
            Err(error) if error.is_retryable() && self.attempt < self.policy.max_attempts => {
                let delay = self.policy.backoff(self.attempt);
                self.attempt += 1;
                Step::RetryAfter {
                    next_attempt: self.attempt,
                    delay,
                    error,
                }
            }
            Err(error) => Step::GiveUp {
                attempts: self.attempt,
                error,
            },
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or the attempts run out.
///
/// The returned error is the last one observed; `is_retryable()` on it tells an
/// exhausted retry budget apart from a permanent failure.
pub async fn call_with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut state = RetryState::new(policy.clone());
    loop {
        let outcome = match tokio::time::timeout(policy.call_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(Error::transient(format!(
                "{} timed out after {:?}",
                label, policy.call_timeout
            ))),
        };

        match state.advance(outcome) {
            Step::Succeeded(value) => return Ok(value),
            Step::RetryAfter {
                next_attempt,
                delay,
                error,
            } => {
                debug!("{} failed ({}); attempt {} in {:?}", label, error, next_attempt, delay);
                tokio::time::sleep(delay).await;
            }
            Step::GiveUp { attempts, error } => {
                warn!("{} gave up after {} attempt(s): {}", label, attempts, error);
                return Err(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            call_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(3000),
            call_timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff(4), Duration::from_millis(3000));
        assert_eq!(policy.backoff(40), Duration::from_millis(3000));
    }

    #[test]
    fn test_state_transitions() {
        let mut state = RetryState::new(fast_policy(2));
        assert_eq!(state.attempt(), 1);

        match state.advance::<()>(Err(Error::transient("busy"))) {
            Step::RetryAfter { next_attempt, .. } => assert_eq!(next_attempt, 2),
            other => panic!("expected retry, got {other:?}"),
        }
        match state.advance::<()>(Err(Error::transient("busy"))) {
            Step::GiveUp { attempts, error } => {
                assert_eq!(attempts, 2);
                assert!(error.is_retryable());
            }
            other => panic!("expected give up, got {other:?}"),
        }
    }

    #[test]
    fn test_permanent_error_is_not_retried() {
        let mut state = RetryState::new(fast_policy(5));
        assert!(matches!(
            state.advance::<()>(Err(Error::permanent("bad input"))),
            Step::GiveUp { attempts: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_call_recovers_from_transient_failures() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let value = call_with_retry(&fast_policy(4), "embed", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::transient("busy"))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_call_exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = call_with_retry(&fast_policy(3), "embed", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::transient("busy"))
        })
        .await
        .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_slow_call_times_out_as_transient() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = call_with_retry(&fast_policy(2), "embed", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();

        assert!(err.is_retryable());
        assert!(err.to_string().contains("timed out"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
