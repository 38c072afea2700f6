//! Bounded retry with exponential backoff
//!
//! Transient infrastructure failures are retried a small, fixed number of
//! times by the component that owns the call. Anything else fails through
//! immediately, and an exhausted retry budget escalates to a
//! precondition-class error so the operator sees "environment not ready"
//! rather than an endless retry loop.

use crate::error::{EnclaveError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy: total attempt count and base delay, doubled per attempt.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

/// Runs `op` until it succeeds, fails non-transiently, or the attempt
/// budget is exhausted.
///
/// Only errors classified transient are retried. On exhaustion the last
/// error is escalated to [`EnclaveError::Endpoint`] so it propagates as an
/// environment failure.
pub async fn with_backoff<T, F, Fut>(label: &str, policy: Backoff, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut delay = policy.base_delay;

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(
                    operation = label,
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) if e.is_transient() => {
                return Err(EnclaveError::Endpoint(format!(
                    "{}: retries exhausted after {} attempts: {}",
                    label, attempts, e
                )));
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("retry loop returns on final attempt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick() -> Backoff {
        Backoff {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_backoff("op", quick(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EnclaveError::Transient("busy".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_fails_immediately() {
        let calls = AtomicU32::new(0);
        let err = with_backoff("op", quick(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(EnclaveError::Validation("rejected".into())) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, EnclaveError::Validation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_escalates_to_environment_class() {
        let calls = AtomicU32::new(0);
        let err = with_backoff("nsm attestation", quick(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(EnclaveError::Transient("still busy".into())) }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("retries exhausted"));
    }
}
