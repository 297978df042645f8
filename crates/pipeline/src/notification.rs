//! Notification pipeline: broadcast to every handler, failures isolated.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::error::{HandlerFailure, NotificationFailures, PipelineError, Result};

/// An event broadcast to zero or more handlers.
pub trait Notification: Send + Sync + 'static {
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

#[async_trait]
pub trait NotificationHandler<N: Notification>: Send + Sync {
    /// Name reported when this handler fails.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn handle(&self, notification: &N, cancel: &CancellationToken) -> Result<()>;
}

/// A decorator around one notification handler invocation.
#[async_trait]
pub trait NotificationBehavior<N: Notification>: Send + Sync {
    async fn handle(
        &self,
        notification: &N,
        handler_name: &str,
        next: NotificationNext<'_, N>,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// The remaining behaviors and the handler for one notification delivery.
pub struct NotificationNext<'a, N: Notification> {
    behaviors: &'a [Arc<dyn NotificationBehavior<N>>],
    handler: &'a dyn NotificationHandler<N>,
}

impl<N: Notification> Clone for NotificationNext<'_, N> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<N: Notification> Copy for NotificationNext<'_, N> {}

impl<N: Notification> NotificationNext<'_, N> {
    pub async fn run(self, notification: &N, cancel: &CancellationToken) -> Result<()> {
        match self.behaviors.split_first() {
            Some((behavior, rest)) => {
                let next = NotificationNext {
                    behaviors: rest,
                    handler: self.handler,
                };
                behavior
                    .handle(notification, self.handler.name(), next, cancel)
                    .await
            }
            None => self.handler.handle(notification, cancel).await,
        }
    }
}

/// Delivers a notification type to every registered handler.
pub struct NotificationPublisher<N: Notification> {
    handlers: Vec<Arc<dyn NotificationHandler<N>>>,
    behaviors: Vec<Arc<dyn NotificationBehavior<N>>>,
}

impl<N: Notification> Default for NotificationPublisher<N> {
    fn default() -> Self {
        Self {
            handlers: Vec::new(),
            behaviors: Vec::new(),
        }
    }
}

impl<N: Notification> NotificationPublisher<N> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler<H>(mut self, handler: H) -> Self
    where
        H: NotificationHandler<N> + 'static,
    {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn with_shared_handler(mut self, handler: Arc<dyn NotificationHandler<N>>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_behavior<B>(mut self, behavior: B) -> Self
    where
        B: NotificationBehavior<N> + 'static,
    {
        self.behaviors.push(Arc::new(behavior));
        self
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Invokes every handler concurrently.
    ///
    /// A failing handler never prevents the others from running; all failures
    /// are returned together. Zero handlers is a success.
    pub async fn publish(&self, notification: &N, cancel: &CancellationToken) -> Result<()> {
        let deliveries = self.handlers.iter().map(|handler| async move {
            let next = NotificationNext {
                behaviors: &self.behaviors,
                handler: handler.as_ref(),
            };
            let result = next.run(notification, cancel).await;
            (handler.name().to_string(), result)
        });

        let failures: Vec<HandlerFailure> = join_all(deliveries)
            .await
            .into_iter()
            .filter_map(|(handler, result)| {
                result.err().map(|error| {
                    tracing::warn!(
                        notification = notification.name(),
                        handler = %handler,
                        error = %error,
                        "Notification handler failed"
                    );
                    HandlerFailure { handler, error }
                })
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Notification(NotificationFailures { failures }))
        }
    }
}
