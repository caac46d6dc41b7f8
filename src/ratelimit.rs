//! Token bucket for metered external APIs.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Allows `rate` calls per `window`, refilled continuously. After an idle
/// period at most `rate` calls go through immediately.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    window: Duration,
    state: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    checked: Instant,
}

impl RateLimiter {
    /// Starts full. A zero rate or window is raised to the smallest usable value.
    pub fn new(rate: u32, window: Duration) -> Self {
        let rate = f64::from(rate.max(1));
        let window = window.max(Duration::from_millis(1));
        Self {
            rate,
            window,
            state: Mutex::new(Bucket {
                tokens: rate,
                checked: Instant::now(),
            }),
        }
    }

    /// Time for one token to accrue.
    pub fn interval(&self) -> Duration {
        self.window.div_f64(self.rate)
    }

    /// Takes a token if one is available.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.checked).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate / self.window.as_secs_f64()).min(self.rate);
        bucket.checked = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Waits for a token, re-checking every `interval()`. Fails with
    /// `Error::Cancelled` as soon as `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if self.try_acquire() {
                return Ok(());
            }

            let wait = self.interval();
            debug!(wait_ms = wait.as_millis() as u64, "Rate limited, waiting for token");
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_bounded_by_rate() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_refill_over_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(10));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(!limiter.try_acquire());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_period_does_not_bank_extra_tokens() {
        let limiter = RateLimiter::new(2, Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(3600)).await;

        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();

        let start = Instant::now();
        limiter.acquire(&cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_releases_blocked_acquire() {
        let limiter = std::sync::Arc::new(RateLimiter::new(1, Duration::from_secs(3600)));
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancelled_token_fails_immediately() {
        let limiter = RateLimiter::new(5, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(limiter.acquire(&cancel).await, Err(Error::Cancelled)));
    }
}
