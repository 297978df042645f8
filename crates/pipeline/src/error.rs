//! Pipeline error types.

use std::time::Duration;

use thiserror::Error;

/// Boxed error produced by handlers, processors and units of work.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by a dispatched request or notification.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// No pipeline or publisher is registered for the type.
    #[error("No handler registered for {0}")]
    HandlerNotFound(&'static str),

    /// The same type was registered twice while wiring the mediator.
    #[error("Duplicate registration for {0}")]
    DuplicateRegistration(&'static str),

    /// The terminal handler failed.
    #[error("Handler failed: {0}")]
    Handler(#[source] BoxError),

    /// A pre-processor rejected the request.
    #[error("Pre-processor failed: {0}")]
    PreProcessor(#[source] BoxError),

    /// A post-processor failed after the handler succeeded.
    #[error("Post-processor failed: {0}")]
    PostProcessor(#[source] BoxError),

    /// One or more notification handlers failed.
    #[error(transparent)]
    Notification(#[from] NotificationFailures),

    /// Beginning or committing a unit of work failed.
    #[error("Unit of work failed: {0}")]
    UnitOfWork(#[source] BoxError),

    /// A guarded execution exceeded its timeout.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The circuit breaker of the named policy is open.
    #[error("Circuit open for policy {0}")]
    CircuitOpen(String),

    /// The bulkhead of the named policy had no free slot.
    #[error("Bulkhead rejected execution for policy {0}")]
    BulkheadRejected(String),

    /// The dispatch was cancelled.
    #[error("Cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Wraps a handler failure.
    pub fn handler(error: impl Into<BoxError>) -> Self {
        PipelineError::Handler(error.into())
    }

    /// Returns the first error of type `E` in the source chain, starting at `self`.
    pub fn find<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(self);
        while let Some(error) = current {
            if let Some(found) = error.downcast_ref::<E>() {
                return Some(found);
            }
            current = error.source();
        }
        None
    }

    /// Returns true if an error of type `E` is in the source chain.
    pub fn is<E>(&self) -> bool
    where
        E: std::error::Error + 'static,
    {
        self.find::<E>().is_some()
    }

    /// Returns true for failures that may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::Timeout(_)
                | PipelineError::BulkheadRejected(_)
                | PipelineError::UnitOfWork(_)
        )
    }
}

/// A single failed notification handler.
#[derive(Debug)]
pub struct HandlerFailure {
    pub handler: String,
    pub error: PipelineError,
}

/// Every failure collected while publishing one notification.
#[derive(Debug, Error)]
#[error("{} notification handler(s) failed: {}", .failures.len(), summarize(.failures))]
pub struct NotificationFailures {
    pub failures: Vec<HandlerFailure>,
}

fn summarize(failures: &[HandlerFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.handler, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
