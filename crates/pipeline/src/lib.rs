//! Dispatch machinery for commands, queries and notifications.
//!
//! This crate provides:
//! - Request pipelines: a terminal handler wrapped by ordered behaviors,
//!   pre-processors and post-processors
//! - Notification publishing with isolated, aggregated handler failures
//! - A type-keyed mediator with explicit registration
//! - Transaction, resilience, correlation and logging behaviors

pub mod behaviors;
pub mod error;
pub mod mediator;
pub mod notification;
pub mod request;
pub mod resilience;
pub mod transaction;

pub use behaviors::{CorrelationBehavior, LoggingBehavior};
pub use error::{BoxError, HandlerFailure, NotificationFailures, PipelineError, Result};
pub use mediator::{Mediator, MediatorBuilder};
pub use notification::{
    Notification, NotificationBehavior, NotificationHandler, NotificationNext,
    NotificationPublisher,
};
pub use request::{
    Next, Pipeline, PipelineBehavior, PipelineBuilder, Request, RequestHandler,
    RequestPostProcessor, RequestPreProcessor,
};
pub use resilience::{
    CircuitBreakerConfig, GuardError, LoggingResilienceObserver, MetricsResilienceObserver,
    ResilienceBehavior, ResilienceContext, ResilienceObserver, ResiliencePolicy, RetryConfig,
};
pub use tokio_util::sync::CancellationToken;
pub use transaction::{RollbackPolicy, Transaction, TransactionBehavior, UnitOfWork};
