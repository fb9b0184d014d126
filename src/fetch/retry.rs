//! Exponential backoff around any [`FetchPage`] implementation.
//!
//! # Retry Strategy
//!
//! - Only errors where [`IngestError::is_retryable`](crate::error::IngestError::is_retryable) holds are retried
//!   (transport failures, 403, 429, 5xx)
//! - Exponential backoff starting at the base delay, capped at 30 seconds
//! - Random jitter (0-250ms by default) added to each delay

use super::FetchPage;
use crate::error::Result;
use crate::models::RawPage;
use rand::{Rng, rng};
use std::fmt;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{error, instrument, warn};

/// Decorator that retries transient fetch failures.
///
/// ```text
/// delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..=max_jitter)
/// ```
pub struct RetryFetch<T> {
    inner: T,
    /// Retries after the first attempt; 0 means a single attempt.
    max_retries: usize,
    base_delay: Duration,
    max_delay: Duration,
    max_jitter: Duration,
}

impl<T> RetryFetch<T>
where
    T: FetchPage,
{
    pub fn new(inner: T, max_retries: usize, base_delay: Duration) -> Self {
        Self {
            inner,
            max_retries,
            base_delay,
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::from_millis(250),
        }
    }

    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    fn delay_for(&self, attempt: usize) -> Duration {
        let shift = u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX).min(16);
        let delay = self.base_delay.saturating_mul(1 << shift).min(self.max_delay);
        let jitter_cap = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter_ms = if jitter_cap == 0 {
            0
        } else {
            rng().random_range(0..=jitter_cap)
        };
        delay + Duration::from_millis(jitter_ms)
    }
}

impl<T> fmt::Debug for RetryFetch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryFetch")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

impl<T> FetchPage for RetryFetch<T>
where
    T: FetchPage,
{
    #[instrument(level = "info", skip(self), fields(max_retries = self.max_retries))]
    async fn fetch(&self, url: &str) -> Result<RawPage> {
        let total_t0 = Instant::now();
        let mut attempt = 0usize;

        loop {
            match self.inner.fetch(url).await {
                Ok(page) => return Ok(page),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    let elapsed_ms_total = total_t0.elapsed().as_millis();
                    if attempt > self.max_retries {
                        if self.max_retries > 0 {
                            error!(attempt, elapsed_ms_total, error = %e, "fetch exhausted retries");
                        }
                        return Err(e);
                    }

                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt,
                        max = self.max_retries,
                        elapsed_ms_total,
                        ?delay,
                        error = %e,
                        "fetch attempt failed; backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;
    use crate::models::PageSource;
    use chrono::Utc;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays scripted results, then succeeds forever.
    struct Scripted {
        failures: Mutex<Vec<IngestError>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(failures: Vec<IngestError>) -> Self {
            Self {
                failures: Mutex::new(failures),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl FetchPage for Scripted {
        async fn fetch(&self, _url: &str) -> Result<RawPage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut failures = self.failures.lock().unwrap();
                if failures.is_empty() {
                    None
                } else {
                    Some(failures.remove(0))
                }
            };
            match next {
                Some(e) => Err(e),
                None => Ok(RawPage {
                    source: PageSource::Snapshot(PathBuf::from("ok.html")),
                    body: b"ok".to_vec(),
                    retrieved_at: Utc::now(),
                }),
            }
        }
    }

    fn status(code: u16) -> IngestError {
        IngestError::Network {
            url: "https://example.com".to_string(),
            status: Some(code),
            reason: format!("status {code}"),
        }
    }

    fn retrying(inner: Scripted, retries: usize) -> RetryFetch<Scripted> {
        RetryFetch::new(inner, retries, Duration::from_millis(1)).with_max_jitter(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let api = retrying(Scripted::new(vec![status(503), status(429)]), 3);
        let page = api.fetch("https://example.com").await.unwrap();
        assert_eq!(page.body, b"ok");
        assert_eq!(api.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let api = retrying(Scripted::new(vec![status(503), status(503), status(503)]), 1);
        let err = api.fetch("https://example.com").await.unwrap_err();
        assert!(matches!(err, IngestError::Network { status: Some(503), .. }));
        assert_eq!(api.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_returns_immediately() {
        let api = retrying(Scripted::new(vec![status(404)]), 5);
        let err = api.fetch("https://example.com").await.unwrap_err();
        assert!(matches!(err, IngestError::Network { status: Some(404), .. }));
        assert_eq!(api.inner.calls.load(Ordering::SeqCst), 1);

        let api = retrying(
            Scripted::new(vec![IngestError::Validation("bad".into())]),
            5,
        );
        assert!(api.fetch("x").await.is_err());
        assert_eq!(api.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_retries_is_single_attempt() {
        let api = retrying(Scripted::new(vec![status(503)]), 0);
        assert!(api.fetch("https://example.com").await.is_err());
        assert_eq!(api.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_is_capped() {
        let api = RetryFetch::new(Scripted::new(vec![]), 10, Duration::from_secs(1))
            .with_max_jitter(Duration::ZERO);
        assert_eq!(api.delay_for(1), Duration::from_secs(1));
        assert_eq!(api.delay_for(3), Duration::from_secs(4));
        assert_eq!(api.delay_for(10), Duration::from_secs(30));
    }
}
