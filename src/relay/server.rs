//! Relay server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::session::copy_stream;
use crate::conn::DeadlineStream;
use crate::error::{Result, ShaperError};
use crate::ratelimit::{ConnContext, ConnMetadata, LimiterRegistry};

/// Forwards every accepted TCP connection to a fixed upstream.
///
/// The client side of each connection is wrapped with the limiters the
/// registry resolves for the relay's tags, user and inbound name, so
/// uploads are paced on reads from the client and downloads on writes to it.
pub struct RelayServer {
    /// Where accepted connections are forwarded
    upstream: SocketAddr,
    /// Limiters shared by every relayed connection
    registry: Arc<LimiterRegistry>,
    /// Inbound name used for limiter resolution
    inbound: String,
    /// User name used for limiter resolution
    user: Option<String>,
    /// Rule tags used for limiter resolution
    tags: Vec<String>,
}

impl RelayServer {
    /// Create a relay with no user and no tags.
    pub fn new(upstream: SocketAddr, registry: Arc<LimiterRegistry>, inbound: impl Into<String>) -> Self {
        Self {
            upstream,
            registry,
            inbound: inbound.into(),
            user: None,
            tags: Vec::new(),
        }
    }

    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Serve until the listener fails.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Serve until `signal` resolves.
    ///
    /// On shutdown every open session's context is cancelled, which also
    /// aborts any pacing wait in progress, and the call returns once all
    /// session tasks have finished.
    pub async fn serve_with_shutdown<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let shutdown = CancellationToken::new();
        let sessions = TaskTracker::new();
        let relay = Arc::new(self);

        info!(
            addr = %listener.local_addr()?,
            upstream = %relay.upstream,
            inbound = %relay.inbound,
            "Starting relay"
        );

        tokio::pin!(signal);
        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!(sessions = sessions.len(), "Relay shutting down");
                    shutdown.cancel();
                    sessions.close();
                    sessions.wait().await;
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    let ctx = ConnContext::with_token(shutdown.child_token());
                    let relay = Arc::clone(&relay);
                    sessions.spawn(async move {
                        match relay.handle(stream, peer, ctx).await {
                            Ok((up, down)) => debug!(peer = %peer, up, down, "Session closed"),
                            Err(e) => debug!(peer = %peer, error = %e, "Session failed"),
                        }
                    });
                }
            }
        }
    }

    /// Relay one client connection, returning bytes moved up and down.
    async fn handle(&self, stream: TcpStream, peer: SocketAddr, ctx: ConnContext) -> Result<(u64, u64)> {
        debug!(peer = %peer, "Accepted connection");

        let upstream = DeadlineStream::new(TcpStream::connect(self.upstream).await?);
        let metadata = ConnMetadata::new(self.user.as_deref(), Some(self.inbound.as_str()));
        let client = self.registry.wrap_stream(
            &ctx,
            Box::new(DeadlineStream::new(stream)),
            &self.tags,
            &metadata,
        );

        tokio::select! {
            result = async {
                tokio::try_join!(
                    copy_stream(&*client, &upstream),
                    copy_stream(&upstream, &*client),
                )
            } => result,
            _ = ctx.cancelled() => Err(ShaperError::Cancelled),
        }
    }
}
