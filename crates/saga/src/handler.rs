//! Pipeline adapter: the orchestrator as the terminal handler of a request
//! pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use pipeline::{PipelineError, Request, RequestHandler};
use tokio_util::sync::CancellationToken;

use crate::event::SagaEvent;
use crate::orchestrator::{SagaOrchestrator, SagaOutcome};

/// Request carrying one inbound saga event and its transport correlation data.
pub struct HandleSagaEvent<E> {
    pub event: Arc<E>,
    pub correlation_id: String,
    pub causation_id: Option<String>,
}

impl<E> HandleSagaEvent<E> {
    pub fn new(event: E, correlation_id: impl Into<String>) -> Self {
        Self {
            event: Arc::new(event),
            correlation_id: correlation_id.into(),
            causation_id: None,
        }
    }

    pub fn caused_by(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }
}

impl<E> Clone for HandleSagaEvent<E> {
    fn clone(&self) -> Self {
        Self {
            event: Arc::clone(&self.event),
            correlation_id: self.correlation_id.clone(),
            causation_id: self.causation_id.clone(),
        }
    }
}

impl<E: SagaEvent> Request for HandleSagaEvent<E> {
    type Response = SagaOutcome;

    fn name(&self) -> &'static str {
        E::EVENT_TYPE
    }
}

/// Hands [`HandleSagaEvent`] requests to the orchestrator.
///
/// Saga errors are wrapped in [`PipelineError::Handler`]; use
/// [`PipelineError::find`] to get the [`SagaError`](crate::SagaError) back.
#[derive(Clone)]
pub struct SagaEventHandler {
    orchestrator: Arc<SagaOrchestrator>,
}

impl SagaEventHandler {
    pub fn new(orchestrator: Arc<SagaOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl<E: SagaEvent> RequestHandler<HandleSagaEvent<E>> for SagaEventHandler {
    async fn handle(
        &self,
        request: &HandleSagaEvent<E>,
        cancel: &CancellationToken,
    ) -> pipeline::Result<SagaOutcome> {
        self.orchestrator
            .handle_event(
                request.event.as_ref(),
                &request.correlation_id,
                request.causation_id.as_deref(),
                cancel,
            )
            .await
            .map_err(PipelineError::handler)
    }
}
