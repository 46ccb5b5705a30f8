//! Token bucket implementation.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

use super::context::ConnContext;
use crate::error::{Result, ShaperError};

/// A token bucket that refills continuously at `rate` tokens per second up
/// to `burst` tokens.
///
/// Takers may overdraw the bucket; the resulting debt is what they wait out.
/// The lock is only ever held for arithmetic, never across an await, so a
/// single bucket can be shared by any number of connections.
#[derive(Debug)]
pub struct TokenBucket {
    /// Refill rate in tokens per second
    rate: f64,
    /// Capacity of the bucket
    burst: usize,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    /// Available tokens; negative while takers are waiting out a debt
    tokens: f64,
    /// When `tokens` was last brought up to date
    last: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(rate: u64, burst: usize) -> Self {
        Self {
            rate: rate as f64,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last: Instant::now(),
            }),
        }
    }

    /// Refill rate in tokens per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Maximum number of tokens obtainable without waiting.
    pub fn burst(&self) -> usize {
        self.burst
    }

    /// Tokens available right now. Negative while the bucket is in debt.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.advance(&mut state, Instant::now());
        state.tokens
    }

    /// Wait until `n` tokens are available, then consume them.
    ///
    /// Fails with [`ShaperError::Cancelled`] if `ctx` ends first, or if its
    /// deadline would pass before the tokens could be granted. A cancelled
    /// wait hands its tokens back.
    pub async fn wait_n(&self, n: usize, ctx: &ConnContext) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(ShaperError::Cancelled);
        }
        if n == 0 {
            return Ok(());
        }

        let ready_at = self.reserve(n, Instant::now());
        if ctx.deadline().is_some_and(|deadline| deadline < ready_at) {
            self.release(n);
            return Err(ShaperError::Cancelled);
        }
        if ready_at <= Instant::now() {
            return Ok(());
        }

        tokio::select! {
            _ = sleep_until(ready_at) => Ok(()),
            _ = ctx.cancelled() => {
                self.release(n);
                Err(ShaperError::Cancelled)
            }
        }
    }

    /// Take `n` tokens and return the instant at which the taker may proceed.
    fn reserve(&self, n: usize, now: Instant) -> Instant {
        let mut state = self.state.lock();
        self.advance(&mut state, now);
        state.tokens -= n as f64;

        if state.tokens >= 0.0 {
            now
        } else {
            now + Duration::from_secs_f64(-state.tokens / self.rate)
        }
    }

    /// Give back tokens taken by a wait that did not complete.
    fn release(&self, n: usize) {
        let mut state = self.state.lock();
        self.advance(&mut state, Instant::now());
        state.tokens = (state.tokens + n as f64).min(self.burst as f64);
    }

    fn advance(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last);
        if elapsed.is_zero() {
            return;
        }
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst as f64);
        state.last = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_starts_full() {
        let bucket = TokenBucket::new(100, 50);
        assert_eq!(bucket.burst(), 50);
        assert_eq!(bucket.rate(), 100.0);
        assert!((bucket.available() - 50.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_within_burst_is_immediate() {
        let bucket = TokenBucket::new(100, 100);
        let ctx = ConnContext::new();
        let start = Instant::now();

        bucket.wait_n(60, &ctx).await.unwrap();
        bucket.wait_n(40, &ctx).await.unwrap();

        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_refill() {
        let bucket = TokenBucket::new(100, 100);
        let ctx = ConnContext::new();
        let start = Instant::now();

        bucket.wait_n(100, &ctx).await.unwrap();
        bucket.wait_n(50, &ctx).await.unwrap();

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(600), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_amount_above_burst_waits_instead_of_failing() {
        let bucket = TokenBucket::new(10, 10);
        let ctx = ConnContext::new();
        let start = Instant::now();

        bucket.wait_n(30, &ctx).await.unwrap();

        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_capped_at_burst() {
        let bucket = TokenBucket::new(10, 10);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!((bucket.available() - 10.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_returns_promptly_and_releases_tokens() {
        let bucket = TokenBucket::new(10, 10);
        let ctx = ConnContext::new();
        bucket.wait_n(10, &ctx).await.unwrap();

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let err = bucket.wait_n(10, &ctx).await.unwrap_err();
        assert!(matches!(err, ShaperError::Cancelled));
        assert!(start.elapsed() < Duration::from_millis(200));

        // Only the refill during the wait is missing; the reservation was undone.
        let available = bucket.available();
        assert!(available > 0.0 && available <= 10.0, "available {}", available);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_shorter_than_wait_fails_fast() {
        let bucket = TokenBucket::new(10, 10);
        let ctx = ConnContext::new().with_deadline(Instant::now() + Duration::from_millis(500));
        bucket.wait_n(10, &ctx).await.unwrap();

        let start = Instant::now();
        let err = bucket.wait_n(10, &ctx).await.unwrap_err();
        assert!(matches!(err, ShaperError::Cancelled));
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(bucket.available().abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_cancelled_context_rejects_immediately() {
        let bucket = TokenBucket::new(10, 10);
        let ctx = ConnContext::new();
        ctx.cancel();

        let err = bucket.wait_n(1, &ctx).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!((bucket.available() - 10.0).abs() < 1e-6);
    }
}
