//! Fixed-backoff retry for retryable failures.

use std::future::Future;
use std::time::Duration;

use skiff_core::error::Result;

use super::pool::CancelToken;

/// Default attempts for layer writes and image pushes.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Run `op` up to `attempts` times, sleeping `backoff` between attempts.
///
/// Only errors whose kind is retryable are retried; everything else,
/// including cancellation, returns immediately. The closure receives the
/// 1-based attempt number.
pub async fn retry_fixed<T, F, Fut>(
    attempts: u32,
    backoff: Duration,
    cancel: &CancelToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        cancel.check()?;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < attempts => {
                tracing::warn!(
                    attempt,
                    attempts,
                    error = %e,
                    "Retrying after failure"
                );
                cancel.sleep(backoff).await?;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::pool::CancelSwitch;
    use skiff_core::error::SkiffError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry_fixed(3, Duration::from_millis(1), &CancelToken::never(), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(SkiffError::TransientIo("reset".to_string()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> =
            retry_fixed(3, Duration::from_millis(1), &CancelToken::never(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(SkiffError::Integrity {
                        digest: "sha256:aa".to_string(),
                        expected: 10,
                        actual: 5,
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(SkiffError::Integrity { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_terminal_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> =
            retry_fixed(3, Duration::from_millis(1), &CancelToken::never(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(SkiffError::Auth {
                        registry: "ghcr.io".to_string(),
                        message: "denied".to_string(),
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(SkiffError::Auth { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let switch = CancelSwitch::new();
        switch.cancel();
        let result: Result<()> =
            retry_fixed(3, Duration::from_millis(1), &switch.token(), |_| async { Ok(()) }).await;
        assert!(matches!(result, Err(SkiffError::Cancelled)));
    }
}
