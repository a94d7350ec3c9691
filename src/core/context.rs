//! Caller-supplied cancellation and deadline for a rates request

use std::fmt::Display;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a request context finished before the work it guarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    Cancelled,
    DeadlineExceeded,
}

impl Display for CancelCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                CancelCause::Cancelled => "context canceled",
                CancelCause::DeadlineExceeded => "context deadline exceeded",
            }
        )
    }
}

/// Cheap to clone; clones observe the same cancellation.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// A context that never finishes on its own.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns the cause if the context has already finished.
    pub fn err(&self) -> Option<CancelCause> {
        if self.token.is_cancelled() {
            return Some(CancelCause::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelCause::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> CancelCause {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => CancelCause::Cancelled,
                _ = tokio::time::sleep_until(deadline) => CancelCause::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                CancelCause::Cancelled
            }
        }
    }
}
