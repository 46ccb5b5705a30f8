//! Per-connection cancellation context.

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Cancellation scope a connection was established under.
///
/// Pacing waits end early with [`ShaperError::Cancelled`] when the token is
/// cancelled or the optional deadline passes. This is separate from the
/// transport deadline used for idle timeouts.
///
/// [`ShaperError::Cancelled`]: crate::error::ShaperError::Cancelled
#[derive(Debug, Clone, Default)]
pub struct ConnContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl ConnContext {
    /// Create a context that is only cancelled explicitly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context driven by an existing token.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Attach a deadline after which the context counts as cancelled.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// A context cancelled whenever this one is, which can also be cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the token is cancelled or the deadline passes.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_child_follows_parent() {
        let parent = ConnContext::new();
        let child = parent.child();
        assert!(!child.is_cancelled());

        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_child_cancel_leaves_parent() {
        let parent = ConnContext::new();
        let child = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_counts_as_cancelled() {
        let ctx = ConnContext::new().with_deadline(Instant::now() + Duration::from_secs(2));
        assert!(!ctx.is_cancelled());

        let start = Instant::now();
        ctx.cancelled().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(ctx.is_cancelled());
    }
}
