//! Cancellation context threaded through step execution.
//!
//! A [`Context`] forms a tree: cancelling a context cancels every context
//! derived from it, and a context derived with a deadline cancels itself when
//! the deadline passes. Unlike a plain cancellation flag, the context records
//! *why* it was cancelled, so hook steps can tell an operator abort apart from
//! a timeout or an engine shutdown.

use async_recursion::async_recursion;
use serde::{Deserialize, Serialize};
use std::future::{Future, pending};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};

use crate::error::{ExecError, Result};

/// Why a context was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CancelCause {
    /// An operator aborted the build.
    Abort,
    /// A deadline derived with [`Context::with_timeout`] passed.
    Timeout,
    /// The engine is draining and releasing its in-flight builds.
    Shutdown,
}

/// Cancellation scope handed to every step.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    parent: Option<Context>,
    cause: watch::Sender<Option<CancelCause>>,
    deadline: Option<Instant>,
}

impl Context {
    /// A root context that is never cancelled unless [`Context::cancel`] is called on it.
    pub fn background() -> Self {
        Self::from_parts(None, None)
    }

    fn from_parts(parent: Option<Context>, deadline: Option<Instant>) -> Self {
        let (cause, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                parent,
                cause,
                deadline,
            }),
        }
    }

    /// Derive a context that is cancelled with its parent or on its own.
    pub fn child(&self) -> Self {
        Self::from_parts(Some(self.clone()), None)
    }

    /// Derive a context that additionally times out after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Self::from_parts(Some(self.clone()), Some(deadline))
    }

    /// Earliest deadline on this context or any ancestor.
    pub fn deadline(&self) -> Option<Instant> {
        let parent = self.inner.parent.as_ref().and_then(Context::deadline);
        match (self.inner.deadline, parent) {
            (Some(own), Some(parent)) => Some(own.min(parent)),
            (own, parent) => own.or(parent),
        }
    }

    /// Cancel this context and its descendants. The first cause wins;
    /// returns false if the context was already cancelled explicitly.
    pub fn cancel(&self, cause: CancelCause) -> bool {
        self.inner.cause.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(cause);
            true
        })
    }

    /// Current cancellation cause, if any.
    ///
    /// Explicit cancellation of this context takes precedence over the
    /// parent's, which takes precedence over this context's own deadline.
    pub fn cause(&self) -> Option<CancelCause> {
        if let Some(cause) = *self.inner.cause.borrow() {
            return Some(cause);
        }
        if let Some(cause) = self.inner.parent.as_ref().and_then(Context::cause) {
            return Some(cause);
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelCause::Timeout),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cause().is_some()
    }

    /// Resolves once the context is cancelled, yielding the cause.
    #[async_recursion]
    pub async fn cancelled(&self) -> CancelCause {
        if let Some(cause) = self.cause() {
            return cause;
        }

        let mut rx = self.inner.cause.subscribe();
        let own = async move {
            let cause = rx.wait_for(Option::is_some).await.ok().and_then(|c| *c);
            match cause {
                Some(cause) => cause,
                None => pending().await,
            }
        };
        let parent = async {
            match &self.inner.parent {
                Some(parent) => parent.cancelled().await,
                None => pending().await,
            }
        };
        let deadline = async {
            match self.inner.deadline {
                Some(deadline) => {
                    sleep_until(deadline).await;
                    CancelCause::Timeout
                }
                None => pending().await,
            }
        };

        tokio::select! {
            biased;
            cause = own => cause,
            cause = parent => cause,
            cause = deadline => cause,
        }
    }

    /// Run `fut` unless and until the context is cancelled, in which case the
    /// future is dropped and the matching cancellation error is returned.
    pub async fn run_until_cancelled<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if let Some(cause) = self.cause() {
            return Err(ExecError::from(cause));
        }

        tokio::select! {
            biased;
            cause = self.cancelled() => Err(ExecError::from(cause)),
            result = fut => result,
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
            .field("cause", &self.cause())
            .field("deadline", &self.deadline())
            .finish()
    }
}
