//! Type-keyed dispatch to registered pipelines and publishers.
//!
//! Registration is explicit: every request and notification type is added
//! through [`MediatorBuilder`] at start-up. Registering a type twice fails the
//! build, so ambiguous wiring never reaches message processing.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::collections::hash_map::Entry;

use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, Result};
use crate::notification::{Notification, NotificationPublisher};
use crate::request::{Pipeline, Request};

type Registry = HashMap<TypeId, Box<dyn Any + Send + Sync>>;

/// Routes requests and notifications to their registered pipeline or publisher.
pub struct Mediator {
    requests: Registry,
    notifications: Registry,
}

impl Mediator {
    pub fn builder() -> MediatorBuilder {
        MediatorBuilder::default()
    }

    /// Sends a request through the pipeline registered for `R`.
    pub async fn send<R: Request>(
        &self,
        request: R,
        cancel: &CancellationToken,
    ) -> Result<R::Response> {
        let pipeline = self
            .requests
            .get(&TypeId::of::<R>())
            .and_then(|entry| entry.downcast_ref::<Pipeline<R>>())
            .ok_or(PipelineError::HandlerNotFound(type_name::<R>()))?;

        pipeline.send(request, cancel).await
    }

    /// Publishes a notification to the publisher registered for `N`.
    ///
    /// A notification type without a publisher has zero handlers, which is a success.
    pub async fn publish<N: Notification>(
        &self,
        notification: &N,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match self
            .notifications
            .get(&TypeId::of::<N>())
            .and_then(|entry| entry.downcast_ref::<NotificationPublisher<N>>())
        {
            Some(publisher) => publisher.publish(notification, cancel).await,
            None => {
                tracing::debug!(
                    notification = notification.name(),
                    "No handlers registered for notification"
                );
                Ok(())
            }
        }
    }

    pub fn handles_request<R: Request>(&self) -> bool {
        self.requests.contains_key(&TypeId::of::<R>())
    }
}

/// Builder for [`Mediator`].
#[derive(Default)]
pub struct MediatorBuilder {
    requests: Registry,
    notifications: Registry,
    duplicate: Option<&'static str>,
}

impl MediatorBuilder {
    /// Registers the pipeline for request type `R`.
    pub fn request<R: Request>(mut self, pipeline: Pipeline<R>) -> Self {
        Self::insert(
            &mut self.requests,
            &mut self.duplicate,
            TypeId::of::<R>(),
            type_name::<R>(),
            Box::new(pipeline),
        );
        self
    }

    /// Registers the publisher for notification type `N`.
    pub fn notification<N: Notification>(mut self, publisher: NotificationPublisher<N>) -> Self {
        Self::insert(
            &mut self.notifications,
            &mut self.duplicate,
            TypeId::of::<N>(),
            type_name::<N>(),
            Box::new(publisher),
        );
        self
    }

    fn insert(
        registry: &mut Registry,
        duplicate: &mut Option<&'static str>,
        key: TypeId,
        name: &'static str,
        value: Box<dyn Any + Send + Sync>,
    ) {
        match registry.entry(key) {
            Entry::Occupied(_) => {
                duplicate.get_or_insert(name);
            }
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
        }
    }

    /// Finishes wiring, failing on the first duplicate registration.
    pub fn build(self) -> Result<Mediator> {
        if let Some(name) = self.duplicate {
            return Err(PipelineError::DuplicateRegistration(name));
        }
        Ok(Mediator {
            requests: self.requests,
            notifications: self.notifications,
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::notification::NotificationHandler;
    use crate::request::RequestHandler;

    struct GetTotal;

    impl Request for GetTotal {
        type Response = u64;
    }

    struct Unregistered;

    impl Request for Unregistered {
        type Response = ();
    }

    struct TotalHandler;

    #[async_trait]
    impl RequestHandler<GetTotal> for TotalHandler {
        async fn handle(&self, _request: &GetTotal, _cancel: &CancellationToken) -> Result<u64> {
            Ok(2500)
        }
    }

    struct Shipped;

    impl Notification for Shipped {}

    struct Broken;

    #[async_trait]
    impl NotificationHandler<Shipped> for Broken {
        async fn handle(&self, _n: &Shipped, _cancel: &CancellationToken) -> Result<()> {
            Err(PipelineError::handler("broken"))
        }
    }

    #[tokio::test]
    async fn test_routes_request_by_type() {
        let mediator = Mediator::builder()
            .request(Pipeline::builder(TotalHandler).build())
            .build()
            .unwrap();

        assert!(mediator.handles_request::<GetTotal>());
        let total = mediator
            .send(GetTotal, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(total, 2500);
    }

    #[tokio::test]
    async fn test_unregistered_request_is_handler_not_found() {
        let mediator = Mediator::builder().build().unwrap();
        let result = mediator.send(Unregistered, &CancellationToken::new()).await;
        assert!(matches!(result, Err(PipelineError::HandlerNotFound(_))));
    }

    #[test]
    fn test_duplicate_request_registration_fails_build() {
        let result = Mediator::builder()
            .request(Pipeline::builder(TotalHandler).build())
            .request(Pipeline::builder(TotalHandler).build())
            .build();
        assert!(matches!(
            result,
            Err(PipelineError::DuplicateRegistration(name)) if name.ends_with("GetTotal")
        ));
    }

    #[tokio::test]
    async fn test_publish_routes_to_registered_publisher() {
        let mediator = Mediator::builder()
            .notification(NotificationPublisher::new().with_handler(Broken))
            .build()
            .unwrap();

        let result = mediator.publish(&Shipped, &CancellationToken::new()).await;
        assert!(matches!(result, Err(PipelineError::Notification(_))));
    }
}
