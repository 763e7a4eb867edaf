use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::warn;

/// Attempts made before a transient failure propagates to the caller.
pub const DEFAULT_TRIES: u32 = 4;

/// First-attempt timeout; doubles after each failed attempt.
pub const DEFAULT_BASE_TIMEOUT: Duration = Duration::from_secs(60 * 5);

/// Runs `op` up to `tries` times, handing it the timeout to apply to that
/// attempt. The timeout starts at `base_timeout` and doubles per attempt.
/// The final attempt's error propagates.
pub async fn with_retries<T, F, Fut>(
    tries: u32,
    base_timeout: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut(Duration) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut timeout = base_timeout;
    let mut last_error = None;

    for attempt in 0..tries {
        match op(timeout).await {
            Ok(v) => return Ok(v),
            Err(error) => {
                warn!(attempt, %error, "attempt failed");
                last_error = Some(error);
                timeout *= 2;
            },
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow!("no attempts were made")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_first_attempt_succeeds() {
        let calls = AtomicU32::new(0);
        let got = with_retries(4, Duration::from_millis(10), |_| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        })
        .await
        .unwrap();

        assert_eq!(got, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_doubles_per_attempt() {
        let mut seen = Vec::new();
        let result: Result<()> =
            with_retries(4, Duration::from_millis(100), |t| {
                seen.push(t);
                async { Err(anyhow!("nope")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(
            seen,
            [100, 200, 400, 800].map(Duration::from_millis).to_vec()
        );
    }

    #[tokio::test]
    async fn test_recovers_mid_sequence() {
        let calls = AtomicU32::new(0);
        let got = with_retries(4, Duration::from_millis(10), |_| async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(anyhow!("transient"))
            } else {
                Ok("done")
            }
        })
        .await
        .unwrap();

        assert_eq!(got, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
