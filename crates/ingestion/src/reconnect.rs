//! Exponential-backoff reconnection for stream sources.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use voxsentinel_common::metrics;

/// Default maximum connection attempts before giving up.
pub const MAX_RETRIES: u32 = 5;
/// Default delay before the second attempt; doubles each retry.
pub const INITIAL_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
#[error("all {attempts} reconnection attempts failed for stream {stream_id}: {last_error}")]
pub struct ReconnectionFailed {
    pub stream_id: Uuid,
    pub attempts: u32,
    pub last_error: String,
}

/// Retries a connection factory with exponential backoff.
///
/// Attempt `n` failing sleeps `initial_delay * 2^(n-1)` before the next
/// try. Every retry increments the per-stream reconnection counter.
#[derive(Debug, Clone, Copy)]
pub struct Reconnector {
    pub max_retries: u32,
    pub initial_delay: Duration,
}

impl Default for Reconnector {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            initial_delay: INITIAL_DELAY,
        }
    }
}

impl Reconnector {
    pub async fn run<T, F, Fut>(
        &self,
        stream_id: Uuid,
        mut factory: F,
    ) -> Result<T, ReconnectionFailed>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut last_error = String::new();
        for attempt in 1..=self.max_retries {
            match factory().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    last_error = err.to_string();
                    warn!(
                        stream_id = %stream_id,
                        attempt,
                        max = self.max_retries,
                        error = %last_error,
                        "source connection failed"
                    );
                    if attempt < self.max_retries {
                        metrics::STREAM_RECONNECTIONS
                            .with_label_values(&[&stream_id.to_string()])
                            .inc();
                        let delay = self.initial_delay * 2u32.pow(attempt - 1);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Err(ReconnectionFailed {
            stream_id,
            attempts: self.max_retries,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> Reconnector {
        Reconnector {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_try() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = fast()
            .run(Uuid::new_v4(), move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>("ok")
                }
            })
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = fast()
            .run(Uuid::new_v4(), move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        anyhow::bail!("nope")
                    }
                    Ok("recovered")
                }
            })
            .await;
        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let stream_id = Uuid::new_v4();
        let result: Result<(), _> = fast()
            .run(stream_id, move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("connection refused")
                }
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.stream_id, stream_id);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.to_string().contains("all 3 reconnection attempts failed"));
    }

    #[test]
    fn defaults_are_sensible() {
        let r = Reconnector::default();
        assert_eq!(r.max_retries, 5);
        assert_eq!(r.initial_delay, Duration::from_secs(1));
    }
}
