//! Rate limited datagram connections.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Instant;

use super::PacketConn;
use crate::error::Result;
use crate::ratelimit::{ConnContext, Direction, RateLimiter};

/// A [`PacketConn`] paced by one [`RateLimiter`].
///
/// Datagrams are never split. A received datagram is paced after it has
/// been read, since its size is only known then; an outgoing one is paced
/// before it is sent.
pub struct LimitedPacket<C> {
    inner: C,
    limiter: Arc<RateLimiter>,
    ctx: ConnContext,
}

impl<C: PacketConn> LimitedPacket<C> {
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
}

#[async_trait]
impl<C: PacketConn> PacketConn for LimitedPacket<C> {
    async fn read_packet(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.refresh_deadline()?;
        let (n, source) = self.inner.read_packet(buf).await?;
        self.limiter
            .wait_n(Direction::Upload, n, &self.ctx)
            .await?;
        Ok((n, source))
    }

    async fn write_packet(&self, buf: &[u8], destination: SocketAddr) -> Result<()> {
        self.refresh_deadline()?;
        self.limiter
            .wait_n(Direction::Download, buf.len(), &self.ctx)
            .await?;
        self.inner.write_packet(buf, destination).await
    }

    fn set_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        self.inner.set_deadline(deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ShaperError;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout_at;

    type Datagram = (Vec<u8>, SocketAddr);

    /// In-memory datagram endpoint: reads come from `incoming`, writes land in `outgoing`.
    struct ChannelPacket {
        incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
        outgoing: mpsc::UnboundedSender<Datagram>,
        deadline: parking_lot::Mutex<Option<Instant>>,
    }

    impl ChannelPacket {
        fn new() -> (Self, mpsc::UnboundedSender<Datagram>, mpsc::UnboundedReceiver<Datagram>) {
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let conn = Self {
                incoming: tokio::sync::Mutex::new(in_rx),
                outgoing: out_tx,
                deadline: parking_lot::Mutex::new(None),
            };
            (conn, in_tx, out_rx)
        }

        fn deadline(&self) -> Option<Instant> {
            *self.deadline.lock()
        }
    }

    #[async_trait]
    impl PacketConn for ChannelPacket {
        async fn read_packet(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
            let deadline = self.deadline();
            let mut incoming = self.incoming.lock().await;
            let received = match deadline {
                Some(deadline) => timeout_at(deadline, incoming.recv())
                    .await
                    .map_err(|_| ShaperError::Timeout)?,
                None => incoming.recv().await,
            };
            let (data, source) = received
                .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::ConnectionAborted))?;
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            Ok((n, source))
        }

        async fn write_packet(&self, buf: &[u8], destination: SocketAddr) -> Result<()> {
            self.outgoing
                .send((buf.to_vec(), destination))
                .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
            Ok(())
        }

        fn set_deadline(&self, deadline: Option<Instant>) -> Result<()> {
            *self.deadline.lock() = deadline;
            Ok(())
        }
    }

    fn peer() -> SocketAddr {
        "192.0.2.10:5353".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_packet_paces_before_sending() {
        let (inner, _in_tx, mut out_rx) = ChannelPacket::new();
        let limiter = Arc::new(RateLimiter::new(100, 0, Duration::ZERO));
        let conn = LimitedPacket::new(inner, limiter, ConnContext::new());

        let start = Instant::now();
        conn.write_packet(&[1u8; 100], peer()).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        conn.write_packet(&[2u8; 50], peer()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(500));

        let (first, to) = out_rx.recv().await.unwrap();
        assert_eq!(first.len(), 100);
        assert_eq!(to, peer());
        let (second, _) = out_rx.recv().await.unwrap();
        assert_eq!(second, vec![2u8; 50]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_datagram_is_not_split() {
        let (inner, _in_tx, mut out_rx) = ChannelPacket::new();
        let limiter = Arc::new(RateLimiter::new(100, 0, Duration::ZERO));
        let conn = LimitedPacket::new(inner, limiter, ConnContext::new());

        let start = Instant::now();
        conn.write_packet(&[9u8; 250], peer()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(1500));

        let (sent, _) = out_rx.recv().await.unwrap();
        assert_eq!(sent.len(), 250);
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_packet_paces_after_receiving() {
        let (inner, in_tx, _out_rx) = ChannelPacket::new();
        let limiter = Arc::new(RateLimiter::new(0, 100, Duration::ZERO));
        let conn = LimitedPacket::new(inner, limiter, ConnContext::new());

        in_tx.send((vec![5u8; 100], peer())).unwrap();
        in_tx.send((vec![6u8; 100], peer())).unwrap();

        let mut buf = [0u8; 512];
        let start = Instant::now();
        let (n, source) = conn.read_packet(&mut buf).await.unwrap();
        assert_eq!((n, source), (100, peer()));
        assert_eq!(start.elapsed(), Duration::ZERO);

        let (n, _) = conn.read_packet(&mut buf).await.unwrap();
        assert_eq!(n, 100);
        assert_eq!(buf[0], 6);
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_on_read_packet() {
        let (inner, _in_tx, _out_rx) = ChannelPacket::new();
        let limiter = Arc::new(RateLimiter::new(0, 0, Duration::from_secs(5)));
        let conn = LimitedPacket::new(inner, limiter, ConnContext::new());

        let mut buf = [0u8; 16];
        let err = conn.read_packet(&mut buf).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_packet_refreshes_deadline() {
        let (inner, _in_tx, _out_rx) = ChannelPacket::new();
        let limiter = Arc::new(RateLimiter::new(0, 0, Duration::from_secs(5)));
        let conn = LimitedPacket::new(inner, limiter, ConnContext::new());

        let before = Instant::now();
        conn.write_packet(b"x", peer()).await.unwrap();
        assert_eq!(conn.get_ref().deadline(), Some(before + Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting_to_send() {
        let (inner, _in_tx, mut out_rx) = ChannelPacket::new();
        let limiter = Arc::new(RateLimiter::new(10, 0, Duration::ZERO));
        let ctx = ConnContext::new();
        let conn = LimitedPacket::new(inner, limiter, ctx.clone());

        conn.write_packet(&[0u8; 10], peer()).await.unwrap();
        out_rx.recv().await.unwrap();

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = conn.write_packet(&[0u8; 10], peer()).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_innermost_timeout_wins_when_stacked() {
        let (inner, in_tx, _out_rx) = ChannelPacket::new();
        let ctx = ConnContext::new();
        let short = Arc::new(RateLimiter::new(0, 0, Duration::from_secs(5)));
        let long = Arc::new(RateLimiter::new(0, 0, Duration::from_secs(30)));

        let conn = LimitedPacket::new(inner, short, ctx.clone());
        let conn = LimitedPacket::new(conn, long, ctx);

        let now = Instant::now();
        conn.write_packet(b"x", peer()).await.unwrap();
        assert_eq!(
            conn.get_ref().get_ref().deadline(),
            Some(now + Duration::from_secs(5))
        );

        tokio::time::advance(Duration::from_secs(2)).await;
        in_tx.send((b"y".to_vec(), peer())).unwrap();
        let mut buf = [0u8; 8];
        conn.read_packet(&mut buf).await.unwrap();
        assert_eq!(
            conn.get_ref().get_ref().deadline(),
            Some(now + Duration::from_secs(7))
        );
    }
}
