//! Service host for the saga orchestrator.
//!
//! Wires configuration, telemetry, the state store, the order saga and the
//! inbound adapter together. The binary in `main.rs` reads messages from
//! stdin; tests build the same wiring over an in-memory store.

pub mod config;
pub mod error;
pub mod inbound;
pub mod order;
pub mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pipeline::{
    CancellationToken, CorrelationBehavior, LoggingBehavior, LoggingResilienceObserver, Mediator,
    MetricsResilienceObserver, NotificationHandler, NotificationPublisher, Pipeline,
    PipelineError, ResilienceBehavior, ResiliencePolicy, RetryConfig, RollbackPolicy,
    TransactionBehavior,
};
use saga::{
    HandleSagaEvent, OrchestratorConfig, SagaError, SagaEvent, SagaEventHandler, SagaLifecycle,
    SagaOrchestrator,
};
use state_store::SagaStateStore;

use config::Config;
use error::Result;
use inbound::InboundAdapter;
use order::{OrderBook, OrderCancelled, OrderPlaced, OrderSaga, PaymentCharged, StockReserved};

/// A wired host: the orchestrator and the adapter feeding it.
pub struct Host {
    pub orchestrator: Arc<SagaOrchestrator>,
    pub adapter: InboundAdapter,
}

impl Host {
    /// Wires the order saga over `store`.
    pub fn build(
        config: &Config,
        store: Arc<dyn SagaStateStore>,
        saga: OrderSaga,
        orders: OrderBook,
    ) -> Result<Self> {
        let orchestrator = Arc::new(build_orchestrator(config, store, saga)?);
        let mediator = build_mediator(orchestrator.clone(), orders)?;
        Ok(Self {
            orchestrator,
            adapter: InboundAdapter::new(Arc::new(mediator)),
        })
    }
}

/// Builds the orchestrator and checks every consumed event type is routed.
pub fn build_orchestrator(
    config: &Config,
    store: Arc<dyn SagaStateStore>,
    saga: OrderSaga,
) -> Result<SagaOrchestrator> {
    let publisher = NotificationPublisher::new().with_handler(LifecycleMetrics);

    let mut builder = SagaOrchestrator::builder(store)
        .config(
            OrchestratorConfig::default().with_max_conflict_retries(config.max_conflict_retries),
        )
        .register(saga.registration())
        .notifications(Arc::new(publisher));
    if let Some(timeout) = config.step_timeout {
        builder = builder.step_policy(Arc::new(step_policy(timeout)));
    }
    let orchestrator = builder.build()?;

    orchestrator.require_route::<OrderPlaced>()?;
    orchestrator.require_route::<StockReserved>()?;
    orchestrator.require_route::<PaymentCharged>()?;
    orchestrator.require_route::<OrderCancelled>()?;
    Ok(orchestrator)
}

fn step_policy(timeout: Duration) -> ResiliencePolicy {
    ResiliencePolicy::new("saga-steps")
        .with_timeout(timeout)
        .with_retry(RetryConfig::new(2, Duration::from_millis(100)))
        .with_observer(Arc::new(LoggingResilienceObserver))
        .with_observer(Arc::new(MetricsResilienceObserver))
}

/// Registers one dispatch pipeline per consumed event type.
pub fn build_mediator(orchestrator: Arc<SagaOrchestrator>, orders: OrderBook) -> Result<Mediator> {
    let handler = SagaEventHandler::new(orchestrator);
    let policy = Arc::new(
        ResiliencePolicy::new("inbound-dispatch")
            .with_retry(RetryConfig::new(3, Duration::from_millis(50)))
            .with_observer(Arc::new(LoggingResilienceObserver))
            .with_observer(Arc::new(MetricsResilienceObserver)),
    );

    let mediator = Mediator::builder()
        .request(dispatch_pipeline::<OrderPlaced>(&handler, &orders, &policy))
        .request(dispatch_pipeline::<StockReserved>(&handler, &orders, &policy))
        .request(dispatch_pipeline::<PaymentCharged>(&handler, &orders, &policy))
        .request(dispatch_pipeline::<OrderCancelled>(&handler, &orders, &policy))
        .build()?;
    Ok(mediator)
}

/// Correlation → logging → resilience → transaction → orchestrator.
fn dispatch_pipeline<E: SagaEvent>(
    handler: &SagaEventHandler,
    orders: &OrderBook,
    policy: &Arc<ResiliencePolicy>,
) -> Pipeline<HandleSagaEvent<E>> {
    Pipeline::builder(handler.clone())
        .behavior(CorrelationBehavior::new())
        .behavior(LoggingBehavior::new())
        .behavior(ResilienceBehavior::new(policy.clone()).retry_when(lost_race))
        .behavior(TransactionBehavior::new(
            Arc::new(orders.clone()),
            RollbackPolicy::none().when(lost_race),
        ))
        .build()
}

/// True when the saga store reported a conflict or outage. The redelivered
/// event then observes whatever the other flow persisted.
fn lost_race(error: &PipelineError) -> bool {
    error
        .find::<SagaError>()
        .is_some_and(SagaError::is_retryable)
}

/// Counts lifecycle notifications per event type.
struct LifecycleMetrics;

#[async_trait]
impl NotificationHandler<SagaLifecycle> for LifecycleMetrics {
    fn name(&self) -> &str {
        "lifecycle-metrics"
    }

    async fn handle(
        &self,
        notification: &SagaLifecycle,
        _cancel: &CancellationToken,
    ) -> pipeline::Result<()> {
        metrics::counter!(
            "saga_lifecycle_notifications_total",
            "event" => notification.event_type()
        )
        .increment(1);
        tracing::debug!(
            event = notification.event_type(),
            saga_id = %notification.saga_id(),
            "saga lifecycle"
        );
        Ok(())
    }
}
