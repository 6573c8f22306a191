//! Cooperative cancellation for awaitable operations.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::status::Status;

struct TokenState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation token accepted by async point operations.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenState>,
}

impl CancellationToken {
    /// Create a token in the not-cancelled state.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenState {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation; wakes every waiter. Idempotent.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Whether cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolve when cancellation is signalled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking the flag, so a cancel between
            // the check and the await cannot be missed.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Race `task` against `token`.
///
/// On cancellation this surfaces `Status::Cancelled` without aborting the
/// underlying work: the spawned task keeps running and completes into the
/// void.
pub async fn with_cancellation<T, Fut>(token: &CancellationToken, task: Fut) -> Result<T, Status>
where
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    if token.is_cancelled() {
        return Err(Status::Cancelled);
    }
    let handle = tokio::spawn(task);
    tokio::select! {
        result = handle => result.map_err(|_| Status::Aborted),
        _ = token.cancelled() => Err(Status::Cancelled),
    }
}
