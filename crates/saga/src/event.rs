use common::SagaId;

/// An inbound event that can be routed to a saga.
///
/// The event type name is static so routes are resolved from a registration
/// table built at start-up.
///
/// # Saga instance id
///
/// The owning instance is [`SagaEvent::saga_id`] when it returns `Some`,
/// otherwise the correlation id passed to
/// [`SagaOrchestrator::handle_event`](crate::SagaOrchestrator::handle_event).
/// Events that carry a business key (an order number) should return it here so
/// redeliveries with a different correlation id still reach the same instance.
pub trait SagaEvent: Send + Sync + 'static {
    /// Stable event type name, as carried in transport headers.
    const EVENT_TYPE: &'static str;

    fn saga_id(&self) -> Option<SagaId> {
        None
    }
}
