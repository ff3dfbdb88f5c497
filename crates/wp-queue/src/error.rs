//! Queue error types

use std::fmt;

use thiserror::Error;
use wp_common::RoutingError;

/// Failure returned by a [`QueueProcessor`](crate::QueueProcessor).
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Business failure: reported on the completion event, the worker keeps going
    #[error(transparent)]
    Domain(#[from] RoutingError),

    /// Bug or infrastructure failure: aborts the worker
    #[error("Unexpected processing failure: {0}")]
    Unexpected(#[source] anyhow::Error),
}

impl ProcessError {
    pub fn unexpected(error: impl Into<anyhow::Error>) -> Self {
        Self::Unexpected(error.into())
    }
}

/// Raised when a worker fails unexpectedly. Carries the item that was in
/// flight plus everything still queued so none of it is lost.
#[derive(Debug, Clone)]
pub struct AbortError<I> {
    pub aborted_item: I,
    pub pending: Vec<I>,
    pub reason: String,
}

impl<I> AbortError<I> {
    /// Number of items carried (in-flight plus pending).
    pub fn item_count(&self) -> usize {
        self.pending.len() + 1
    }
}

impl<I> fmt::Display for AbortError<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "queue aborted with {} pending item(s): {}",
            self.pending.len(),
            self.reason
        )
    }
}

impl<I: fmt::Debug> std::error::Error for AbortError<I> {}

/// An item a route or pool refused; the item is handed back.
#[derive(Debug, Error)]
pub enum SendError<I> {
    #[error("queue is canceled")]
    Canceled(I),

    #[error("item is already queued")]
    Duplicate(I),
}

impl<I> SendError<I> {
    pub fn into_inner(self) -> I {
        match self {
            Self::Canceled(item) | Self::Duplicate(item) => item,
        }
    }
}
