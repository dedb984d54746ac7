//! Exactly-once completion callbacks and cooperative cancellation.
//!
//! Every asynchronous request in nimbus reports its outcome through a
//! [`Completion`]. A completion is consumed when it fires, so it cannot fire
//! twice, and if it is dropped without firing (a worker was torn down, a
//! queue was cleared) it fires with the error type's cancellation value, so
//! it cannot fire zero times either.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::ClientError;

/// Error types that have a "cancelled" value.
pub trait Cancelled {
    /// The value reported when a request is abandoned.
    fn cancelled() -> Self;
}

impl Cancelled for ClientError {
    fn cancelled() -> Self {
        ClientError::Cancelled
    }
}

type Callback<T, E> = Box<dyn FnOnce(Result<T, E>) + Send + 'static>;

/// A callback that fires exactly once.
#[must_use = "dropping a completion reports cancellation"]
pub struct Completion<T, E: Cancelled = ClientError> {
    callback: Option<Callback<T, E>>,
}

impl<T, E: Cancelled> Completion<T, E> {
    /// Wraps `callback`.
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(Result<T, E>) + Send + 'static,
    {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    /// A completion that discards its result.
    pub fn ignore() -> Self
    where
        T: 'static,
        E: 'static,
    {
        Self::new(|_| {})
    }

    /// Fires the callback with `result`.
    pub fn complete(mut self, result: Result<T, E>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }

    /// Fires the callback with a success value.
    pub fn succeed(self, value: T) {
        self.complete(Ok(value));
    }

    /// Fires the callback with an error.
    pub fn fail(self, error: E) {
        self.complete(Err(error));
    }

    /// Adapts the success type, preserving the exactly-once guarantee.
    pub fn map<U, F>(self, f: F) -> Completion<U, E>
    where
        T: 'static,
        E: 'static,
        U: 'static,
        F: FnOnce(U) -> T + Send + 'static,
    {
        Completion::new(move |result: Result<U, E>| self.complete(result.map(f)))
    }
}

impl<T, E: Cancelled> Drop for Completion<T, E> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(Err(E::cancelled()));
        }
    }
}

impl<T, E: Cancelled> fmt::Debug for Completion<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

/// A shareable cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates an uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Returns `true` if this call made the change.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
