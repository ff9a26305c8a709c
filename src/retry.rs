//! Retry with exponential backoff
//!
//! Used by the group coordinator client (join, heartbeat-driven rejoin),
//! the producer (append) and the transaction manager (markers) for
//! transient failures only. Fencing errors are never retried.
//!
//! ```text
//! backoff = min(initial_backoff * multiplier^attempt, max_backoff)
//!
//! defaults (100ms initial, 2x multiplier, 10s max, 5 retries):
//!   attempt 0: 100ms
//!   attempt 1: 200ms
//!   attempt 2: 400ms
//!   ...
//! ```

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::defaults::{
    DEFAULT_RETRY_BACKOFF_MULTIPLIER, DEFAULT_RETRY_INITIAL_BACKOFF_MS,
    DEFAULT_RETRY_MAX_BACKOFF_MS, DEFAULT_RETRY_MAX_RETRIES,
};
use crate::error::{ClientError, Result};

/// Retry policy configuration for exponential backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first try
    pub max_retries: u32,

    /// Backoff before the first retry
    pub initial_backoff_ms: u64,

    /// Upper bound on any single backoff
    pub max_backoff_ms: u64,

    /// Growth factor between consecutive backoffs
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_RETRY_MAX_RETRIES,
            initial_backoff_ms: DEFAULT_RETRY_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_RETRY_MAX_BACKOFF_MS,
            backoff_multiplier: DEFAULT_RETRY_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_backoff_ms: initial_backoff.as_millis() as u64,
            max_backoff_ms: max_backoff.as_millis() as u64,
            backoff_multiplier,
        }
    }

    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.min(63) as i32);
        let backoff_ms = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(backoff_ms as u64)
    }
}

/// Run `f` until it succeeds, fails with a non-retriable error, or the
/// policy's retry bound is exceeded.
///
/// Exceeding the bound logs a warning and yields
/// [`ClientError::RetriesExhausted`] wrapping the last failure.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_retriable() => return Err(e),
            Err(e) if attempt >= policy.max_retries => {
                warn!(
                    operation,
                    attempts = attempt + 1,
                    error = %e,
                    "Retry bound exceeded"
                );
                return Err(ClientError::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: attempt + 1,
                    last: Box::new(e),
                });
            }
            Err(e) => {
                let backoff = policy.backoff_for_attempt(attempt);
                debug!(
                    operation,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::TopicPartition;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            Duration::from_millis(1),
            Duration::from_millis(5),
            2.0,
        )
    }

    #[test]
    fn test_backoff_growth_is_capped() {
        let policy = RetryPolicy::new(
            10,
            Duration::from_millis(100),
            Duration::from_millis(1000),
            2.0,
        );
        assert_eq!(policy.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for_attempt(3), Duration::from_millis(800));
        assert_eq!(policy.backoff_for_attempt(4), Duration::from_millis(1000));
        assert_eq!(policy.backoff_for_attempt(40), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&fast_policy(3), "fetch", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ClientError::Timeout("fetch".into()))
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
    async fn test_exhaustion_wraps_last_error() {
        let calls = AtomicU32::new(0);
        let err = retry_with_backoff(&fast_policy(2), "commit", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ClientError::BrokerNotAvailable("b0".into())) }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            ClientError::RetriesExhausted { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, ClientError::BrokerNotAvailable(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_fencing_is_not_retried() {
        let calls = AtomicU32::new(0);
        let err = retry_with_backoff(&fast_policy(5), "commit", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(), _>(ClientError::StaleEpoch {
                    partition: TopicPartition::new("t", 0),
                    current: 2,
                    requested: 1,
                })
            }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(err.is_fencing());
    }
}
