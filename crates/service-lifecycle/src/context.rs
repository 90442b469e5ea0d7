//! Cancellation context for lifecycle operations
//!
//! A [`Context`] is a node in a tree of cancellation scopes backed by a
//! [`CancellationToken`]. Cancelling a context cancels every context derived
//! from it, and a context may carry a deadline that is inherited by (and can
//! only be tightened in) its children. Every lifecycle phase, hook and runner
//! receives one.
//!
//! The cancellation cause is write-once: the call that records it is the one
//! that cancelled the context, so concurrent and repeated cancellation takes
//! effect exactly once.

use crate::Error;
use futures::future::{self, Either};
use std::future::Future;
use std::pin::pin;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

struct Inner {
    token: CancellationToken,
    cause: OnceLock<String>,
    deadline: Option<Instant>,
    parent: Option<Context>,
}

/// Cancellable, deadline-carrying context
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// Create a root context that is never cancelled on its own
    pub fn background() -> Self {
        Self::build(CancellationToken::new(), None, None)
    }

    fn build(token: CancellationToken, parent: Option<Context>, deadline: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(Inner {
                token,
                cause: OnceLock::new(),
                deadline,
                parent,
            }),
        }
    }

    /// Derive a child context cancelled together with this one
    pub fn child(&self) -> Self {
        Self::build(
            self.inner.token.child_token(),
            Some(self.clone()),
            self.inner.deadline,
        )
    }

    /// Derive a child context that additionally expires after `timeout`
    ///
    /// A timeout too large to represent as an instant adds no deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self.child(),
        }
    }

    /// Derive a child context that additionally expires at `deadline`
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.inner.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self::build(
            self.inner.token.child_token(),
            Some(self.clone()),
            Some(deadline),
        )
    }

    /// Cancel this context and everything derived from it
    ///
    /// Returns `true` only for the call that actually performed the
    /// cancellation.
    pub fn cancel(&self) -> bool {
        self.cancel_with_cause("canceled")
    }

    /// Cancel with a human-readable cause kept for diagnostics
    ///
    /// Returns `false` when the context was already cancelled, by an earlier
    /// call or through an ancestor.
    pub fn cancel_with_cause(&self, cause: impl Into<String>) -> bool {
        if self.inner.token.is_cancelled() {
            return false;
        }
        if self.inner.cause.set(cause.into()).is_err() {
            return false;
        }
        self.inner.token.cancel();
        true
    }

    /// Effective deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Why this context (or the nearest cancelled ancestor) was cancelled
    pub fn cause(&self) -> Option<&str> {
        if !self.inner.token.is_cancelled() {
            return None;
        }
        match self.inner.cause.get() {
            Some(cause) => Some(cause.as_str()),
            None => self.inner.parent.as_ref().and_then(Context::cause),
        }
    }

    /// The reason this context is done, or `None` while it is live
    ///
    /// Explicit cancellation anywhere up the chain reports
    /// [`Error::Canceled`]; an elapsed deadline reports
    /// [`Error::DeadlineExceeded`].
    pub fn err(&self) -> Option<Error> {
        if self.inner.token.is_cancelled() {
            return Some(Error::Canceled);
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Error::DeadlineExceeded),
            _ => None,
        }
    }

    /// Whether the context is cancelled or past its deadline
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Whether both handles refer to the same context
    pub(crate) fn same(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolve once this context is cancelled or its deadline elapses
    pub async fn cancelled(&self) {
        let cancelled = pin!(self.inner.token.cancelled());
        match self.inner.deadline {
            Some(deadline) => {
                future::select(cancelled, smol::Timer::at(deadline)).await;
            }
            None => cancelled.await,
        }
    }

    /// Drive `fut` to completion unless the context finishes first
    ///
    /// When the context wins the race the pending future is dropped and the
    /// context's error is returned.
    pub async fn run<F, T>(&self, fut: F) -> std::result::Result<T, Error>
    where
        F: Future<Output = T>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        let fut = pin!(fut);
        let done = pin!(self.cancelled());
        match future::select(fut, done).await {
            Either::Left((value, _)) => Ok(value),
            Either::Right(_) => Err(self.err().unwrap_or(Error::Canceled)),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("done", &self.is_done())
            .field("cause", &self.cause())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}
