//! Connection capabilities and rate limited wrappers.
//!
//! [`StreamConn`] and [`PacketConn`] describe what the shaper needs from a
//! connection: reads and writes that may run concurrently from different
//! tasks, plus a deadline that aborts in-flight I/O with
//! [`ShaperError::Timeout`]. [`DeadlineStream`] and [`DeadlineSocket`] adapt
//! tokio transports to these traits; [`LimitedStream`] and [`LimitedPacket`]
//! decorate any implementation with one rate limiter and can be stacked.

mod packet;
mod stream;

pub use packet::LimitedPacket;
pub use stream::LimitedStream;

use async_trait::async_trait;
use std::future::Future;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};

use crate::error::{Result, ShaperError};

/// An ordered byte stream.
#[async_trait]
pub trait StreamConn: Send + Sync {
    /// Read into `buf`, returning the number of bytes read. `0` means EOF.
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write from `buf`, returning how many bytes were accepted.
    async fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Set the deadline for all current and future reads and writes.
    /// `None` disables it.
    fn set_deadline(&self, deadline: Option<Instant>) -> Result<()>;

    /// Shut down the write side.
    async fn shutdown(&self) -> Result<()>;
}

/// A message oriented transport with per-message peer addresses.
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Receive one datagram into `buf`, returning its length and sender.
    async fn read_packet(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;

    /// Send `buf` as one datagram to `destination`.
    async fn write_packet(&self, buf: &[u8], destination: SocketAddr) -> Result<()>;

    /// Set the deadline for all current and future reads and writes.
    fn set_deadline(&self, deadline: Option<Instant>) -> Result<()>;
}

#[async_trait]
impl<T: StreamConn + ?Sized> StreamConn for Box<T> {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf).await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        (**self).write(buf).await
    }

    fn set_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        (**self).set_deadline(deadline)
    }

    async fn shutdown(&self) -> Result<()> {
        (**self).shutdown().await
    }
}

#[async_trait]
impl<T: PacketConn + ?Sized> PacketConn for Box<T> {
    async fn read_packet(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        (**self).read_packet(buf).await
    }

    async fn write_packet(&self, buf: &[u8], destination: SocketAddr) -> Result<()> {
        (**self).write_packet(buf, destination).await
    }

    fn set_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        (**self).set_deadline(deadline)
    }
}

/// Run `io` until it completes or the deadline held by `deadline` passes.
///
/// The deadline is followed while `io` is pending, so moving it moves the
/// expiry of calls already in flight. An already expired deadline fails
/// without touching the transport.
async fn with_deadline<T, F>(deadline: &watch::Sender<Option<Instant>>, io: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    let mut changes = deadline.subscribe();
    let mut current = *changes.borrow_and_update();
    if matches!(current, Some(at) if Instant::now() >= at) {
        return Err(ShaperError::Timeout);
    }

    tokio::pin!(io);
    loop {
        let expiry = async move {
            match current {
                Some(at) => sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = &mut io => return result.map_err(ShaperError::from),
            _ = expiry => return Err(ShaperError::Timeout),
            Ok(()) = changes.changed() => {
                current = *changes.borrow_and_update();
            }
        }
    }
}

/// Adapts a tokio byte stream to [`StreamConn`].
///
/// The stream is split so a read and a write can be in flight at once;
/// concurrent reads (or writes) queue behind each other.
pub struct DeadlineStream<S> {
    reader: tokio::sync::Mutex<ReadHalf<S>>,
    writer: tokio::sync::Mutex<WriteHalf<S>>,
    deadline: watch::Sender<Option<Instant>>,
}

impl<S: AsyncRead + AsyncWrite> DeadlineStream<S> {
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            deadline: watch::Sender::new(None),
        }
    }

    /// Recover the original stream.
    pub fn into_inner(self) -> S
    where
        S: Unpin,
    {
        self.reader.into_inner().unsplit(self.writer.into_inner())
    }

    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.borrow()
    }
}

#[async_trait]
impl<S> StreamConn for DeadlineStream<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut reader = self.reader.lock().await;
        with_deadline(&self.deadline, reader.read(buf)).await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut writer = self.writer.lock().await;
        with_deadline(&self.deadline, writer.write(buf)).await
    }

    fn set_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        self.deadline.send_replace(deadline);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        with_deadline(&self.deadline, writer.shutdown()).await
    }
}

/// Adapts a tokio [`UdpSocket`] to [`PacketConn`].
pub struct DeadlineSocket {
    socket: UdpSocket,
    deadline: watch::Sender<Option<Instant>>,
}

impl DeadlineSocket {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            deadline: watch::Sender::new(None),
        }
    }

    pub fn get_ref(&self) -> &UdpSocket {
        &self.socket
    }

    pub fn into_inner(self) -> UdpSocket {
        self.socket
    }

    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.borrow()
    }
}

#[async_trait]
impl PacketConn for DeadlineSocket {
    async fn read_packet(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        with_deadline(&self.deadline, self.socket.recv_from(buf)).await
    }

    async fn write_packet(&self, buf: &[u8], destination: SocketAddr) -> Result<()> {
        with_deadline(&self.deadline, self.socket.send_to(buf, destination))
            .await
            .map(|_| ())
    }

    fn set_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        self.deadline.send_replace(deadline);
        Ok(())
    }
}
