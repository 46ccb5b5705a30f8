//! Rate limited byte streams.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;

use super::StreamConn;
use crate::error::{Result, ShaperError};
use crate::ratelimit::{ConnContext, Direction, RateLimiter};

/// A [`StreamConn`] paced by one [`RateLimiter`].
///
/// Reads are capped at the upload burst and paced after the data arrives.
/// Writes are cut into download-burst sized chunks, each paced before it is
/// sent. Every call first re-arms the idle deadline when the limiter has a
/// timeout. Several limiters apply by nesting wrappers; the innermost one
/// re-arms the deadline last, so its timeout is the one in force.
///
/// If the context is cancelled while a read is being paced, the bytes
/// already taken from the transport are dropped and the read fails with
/// [`ShaperError::Cancelled`]. Cancellation tears the connection down, so
/// nothing downstream would forward them anyway.
pub struct LimitedStream<C> {
    inner: C,
    limiter: Arc<RateLimiter>,
    ctx: ConnContext,
}

impl<C: StreamConn> LimitedStream<C> {
    pub fn new(inner: C, limiter: Arc<RateLimiter>, ctx: ConnContext) -> Self {
        Self {
            inner,
            limiter,
            ctx,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn context(&self) -> &ConnContext {
        &self.ctx
    }

    /// The wrapped connection.
    pub fn get_ref(&self) -> &C {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut C {
        &mut self.inner
    }

    pub fn into_inner(self) -> C {
        self.inner
    }

    fn refresh_deadline(&self) -> Result<()> {
        match self.limiter.idle_deadline() {
            Some(deadline) => self.inner.set_deadline(Some(deadline)),
            None => Ok(()),
        }
    }

    /// Write all of `chunk`, adding what was accepted to `written`.
    async fn write_chunk(&self, chunk: &[u8], written: &mut usize) -> Result<()> {
        let mut remaining = chunk;
        while !remaining.is_empty() {
            let n = self.inner.write(remaining).await?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
            }
            *written += n;
            remaining = &remaining[n..];
        }
        Ok(())
    }
}

/// Attach the progress made so far to a failed write.
fn partial(written: usize, err: ShaperError) -> ShaperError {
    if written == 0 {
        err
    } else {
        ShaperError::PartialWrite {
            written,
            source: Box::new(err),
        }
    }
}

#[async_trait]
impl<C: StreamConn> StreamConn for LimitedStream<C> {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.refresh_deadline()?;

        let Some(burst) = self.limiter.burst(Direction::Upload) else {
            return self.inner.read(buf).await;
        };

        let len = buf.len().min(burst);
        let n = self.inner.read(&mut buf[..len]).await?;
        self.limiter
            .wait_n(Direction::Upload, n, &self.ctx)
            .await?;
        Ok(n)
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.refresh_deadline()?;

        let Some(burst) = self.limiter.burst(Direction::Download) else {
            return self.inner.write(buf).await;
        };

        let mut written = 0;
        for chunk in buf.chunks(burst.max(1)) {
            if let Err(err) = self
                .limiter
                .wait_n(Direction::Download, chunk.len(), &self.ctx)
                .await
            {
                return Err(partial(written, err));
            }
            if let Err(err) = self.write_chunk(chunk, &mut written).await {
                return Err(partial(written, err));
            }
        }
        Ok(written)
    }

    fn set_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        self.inner.set_deadline(deadline)
    }

    async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown().await
    }
}
