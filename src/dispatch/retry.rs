use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::dispatch::provider::Attempt;

/// Fixed-delay retry budget for one provider. Only listed status codes are
/// retried; network errors and timeouts move straight on.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub status_codes: Vec<u16>,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn for_provider(provider: &ProviderConfig, backoff: Duration) -> Self {
        Self {
            max_retries: provider.max_retries,
            status_codes: provider.retryable_status_codes.clone(),
            backoff,
        }
    }

    pub fn is_retryable(&self, status: Option<u16>) -> bool {
        status.is_some_and(|s| self.status_codes.contains(&s))
    }
}

/// Run `send` until it succeeds, fails with a non-retryable outcome, or the
/// budget runs out. Returns the last attempt. `send` receives the 1-based
/// attempt number.
pub async fn run_with_retry<F, Fut>(provider: &str, policy: &RetryPolicy, mut send: F) -> Attempt
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        let outcome = send(attempt).await;

        if outcome.is_success() || !policy.is_retryable(outcome.status) {
            return outcome;
        }

        if attempt > policy.max_retries {
            debug!(
                provider,
                "Exhausted {} retries; last status: {:?}", policy.max_retries, outcome.status
            );
            return outcome;
        }

        warn!(
            provider,
            "Attempt {}/{} failed with status {:?}. Retrying in {:?}...",
            attempt,
            policy.max_retries + 1,
            outcome.status,
            policy.backoff
        );
        sleep(policy.backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::provider::AttemptError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn policy(max_retries: u32, backoff_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            status_codes: vec![429, 503],
            backoff: Duration::from_millis(backoff_ms),
        }
    }

    fn with_status(status: u16) -> Attempt {
        Attempt {
            status: Some(status),
            elapsed: Duration::ZERO,
            usage: None,
            cost: None,
            response_snapshot: None,
            result: if status == 200 {
                Ok("ok".into())
            } else {
                Err(AttemptError::Status { status, body: String::new() })
            },
        }
    }

    #[tokio::test]
    async fn test_retryable_status_then_success() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let last = run_with_retry("hf", &policy(1, 100), |n| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { with_status(if n == 1 { 503 } else { 200 }) }
        })
        .await;

        assert!(last.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(start.elapsed() >= Duration::from_millis(100), "fixed backoff is honoured");
    }

    #[tokio::test]
    async fn test_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let last = run_with_retry("hf", &policy(1, 1), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { with_status(429) }
        })
        .await;

        assert_eq!(last.status, Some(429));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_status_is_not_retried() {
        let calls = AtomicU32::new(0);
        let last = run_with_retry("hf", &policy(1, 1), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { with_status(500) }
        })
        .await;

        assert_eq!(last.status, Some(500));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_budget_never_retries() {
        let calls = AtomicU32::new(0);
        run_with_retry("openai", &policy(0, 1), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { with_status(503) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transport_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        run_with_retry("hf", &policy(1, 1), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Attempt {
                    status: None,
                    elapsed: Duration::ZERO,
                    usage: None,
                    cost: None,
                    response_snapshot: None,
                    result: Err(AttemptError::Transport("connection refused".into())),
                }
            }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
