//! Bounded exponential backoff for backing-store round-trips.

use std::future::Future;
use std::time::Duration;

use crate::core::error::{Result, ZakuError};

/// Retry policy: `attempts` tries total, sleeping `base * 2^n` between them.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub attempts: u32,
    pub base: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempts: 5,
            base: Duration::from_millis(10),
        }
    }
}

impl Backoff {
    /// Run `op`, retrying transient store failures. Non-retryable errors
    /// surface immediately.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = self.base;
        let mut last: Option<ZakuError> = None;
        for attempt in 0..self.attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.kind.is_retryable() => {
                    tracing::warn!(attempt, error = %e, "store operation failed, backing off");
                    last = Some(e);
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| ZakuError::store_unavailable("retries exhausted")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let backoff = Backoff {
            attempts: 5,
            base: Duration::from_millis(1),
        };
        let result = backoff
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ZakuError::store_unavailable("flaky"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_surface_immediately() {
        let calls = AtomicU32::new(0);
        let backoff = Backoff::default();
        let result: Result<()> = backoff
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ZakuError::conflict("nope")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        let calls = AtomicU32::new(0);
        let backoff = Backoff {
            attempts: 3,
            base: Duration::from_millis(1),
        };
        let result: Result<()> = backoff
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ZakuError::store_unavailable("down")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
