//! Core rate limiter implementation.

use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use super::bucket::TokenBucket;
use super::context::ConnContext;
use crate::error::Result;

/// Traffic direction, seen from the proxy's client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Bytes sent to the client (writes on the wrapped connection)
    Download,
    /// Bytes received from the client (reads on the wrapped connection)
    Upload,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Download => write!(f, "download"),
            Direction::Upload => write!(f, "upload"),
        }
    }
}

/// Bandwidth budget and idle timeout applied to connections.
///
/// A direction without a bucket is unlimited. Each bucket's burst equals
/// one second worth of its rate.
#[derive(Debug)]
pub struct RateLimiter {
    download: Option<TokenBucket>,
    upload: Option<TokenBucket>,
    timeout: Option<Duration>,
}

impl RateLimiter {
    /// Create a rate limiter. Zero rates and a zero timeout mean "not set".
    pub fn new(download: u64, upload: u64, timeout: Duration) -> Self {
        Self {
            download: Self::bucket(download),
            upload: Self::bucket(upload),
            timeout: (!timeout.is_zero()).then_some(timeout),
        }
    }

    fn bucket(rate: u64) -> Option<TokenBucket> {
        if rate == 0 {
            return None;
        }
        let burst = usize::try_from(rate).unwrap_or(usize::MAX);
        Some(TokenBucket::new(rate, burst))
    }

    /// The bucket pacing the given direction, if any.
    pub fn bucket_for(&self, direction: Direction) -> Option<&TokenBucket> {
        match direction {
            Direction::Download => self.download.as_ref(),
            Direction::Upload => self.upload.as_ref(),
        }
    }

    /// Largest amount that can pass in one go for the given direction.
    ///
    /// `None` when the direction is unlimited.
    pub fn burst(&self, direction: Direction) -> Option<usize> {
        self.bucket_for(direction).map(TokenBucket::burst)
    }

    /// Wait until `amount` bytes may pass in the given direction.
    ///
    /// Returns immediately when the direction is unlimited.
    pub async fn wait_n(&self, direction: Direction, amount: usize, ctx: &ConnContext) -> Result<()> {
        let Some(bucket) = self.bucket_for(direction) else {
            return Ok(());
        };

        trace!(direction = %direction, amount = amount, "Pacing transfer");
        bucket.wait_n(amount, ctx).await
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The transport deadline an I/O call starting now should use.
    pub fn idle_deadline(&self) -> Option<Instant> {
        self.timeout.map(|timeout| Instant::now() + timeout)
    }

    /// Whether this limiter has anything to enforce.
    pub fn is_noop(&self) -> bool {
        self.download.is_none() && self.upload.is_none() && self.timeout.is_none()
    }
}
