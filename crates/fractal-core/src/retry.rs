//! Bounded retry with exponential backoff and jitter.

use std::future::Future;
use tracing::warn;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryConfig {
    fn delay_for(&self, attempt: u32) -> u64 {
        let base = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        let jitter = (base as f64 * 0.1 * jitter_fraction(attempt)) as u64;
        base.saturating_add(jitter).min(self.max_delay_ms)
    }
}

/// Deterministic jitter in [0, 1) derived from the attempt number.
fn jitter_fraction(attempt: u32) -> f64 {
    let x = attempt.wrapping_add(1).wrapping_mul(2654435761);
    (x % 100) as f64 / 100.0
}

/// Run `op` with bounded retries. Only transient errors are retried; the
/// last error is surfaced once the budget is exhausted.
pub async fn with_backoff<T, F, Fut>(config: RetryConfig, op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error: Option<Error> = None;

    for attempt in 0..config.max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !e.is_transient() || attempt + 1 == config.max_attempts {
                    return Err(e);
                }
                let delay = config.delay_for(attempt);
                warn!(
                    op = op_name,
                    attempt = attempt + 1,
                    delay_ms = delay,
                    error = %e,
                    "Retrying after transient failure"
                );
                tokio::time::sleep(tokio::time::Duration::from_millis(delay)).await;
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| Error::Other(format!("{op_name}: retry budget exhausted"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_respects_cap() {
        let config = RetryConfig::default();
        for attempt in 0..10 {
            assert!(config.delay_for(attempt) <= config.max_delay_ms);
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(
            RetryConfig {
                base_delay_ms: 1,
                ..Default::default()
            },
            "test",
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::store_unavailable("flaky"))
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_validation_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_backoff(RetryConfig::default(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::validation("bad input")) }
        })
        .await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn surfaces_last_error_when_exhausted() {
        let result: Result<()> = with_backoff(
            RetryConfig {
                max_attempts: 2,
                base_delay_ms: 1,
                max_delay_ms: 2,
            },
            "test",
            || async { Err(Error::store_unavailable("still down")) },
        )
        .await;
        assert!(matches!(result, Err(Error::StoreUnavailable(_))));
    }
}
