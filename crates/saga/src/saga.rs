//! The saga abstraction: an ordered sequence of compensable steps.

use async_trait::async_trait;
use common::{CorrelationContext, SagaId};
use pipeline::BoxError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::step::SagaStepId;

/// A saga definition.
///
/// One definition backs every instance of its saga type. The orchestrator
/// calls [`Saga::execute`] for each step in [`Saga::steps`] order and, when a
/// step fails, [`Saga::compensate`] for every executed step in reverse order.
/// Both dispatch on [`SagaContext::step_id`].
#[async_trait]
pub trait Saga: Send + Sync + 'static {
    /// Application-defined payload persisted with every instance.
    type State: Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static;

    /// Stable name of the saga type, persisted with every instance.
    fn saga_type(&self) -> &'static str;

    /// The ordered step ids. Must be non-empty and free of duplicates.
    fn steps(&self) -> Vec<SagaStepId>;

    /// Runs the forward action of `ctx.step_id()`.
    async fn execute(
        &self,
        ctx: &mut SagaContext<Self::State>,
        cancel: &CancellationToken,
    ) -> Result<(), StepError>;

    /// Runs the compensating action of `ctx.step_id()`.
    async fn compensate(
        &self,
        ctx: &mut SagaContext<Self::State>,
        cancel: &CancellationToken,
    ) -> Result<(), StepError>;
}

/// Everything a step invocation may see and change.
///
/// Mutations to the state are persisted only when the step succeeds.
#[derive(Debug, Clone)]
pub struct SagaContext<S> {
    saga_id: SagaId,
    step_id: SagaStepId,
    state: S,
    correlation: CorrelationContext,
}

impl<S> SagaContext<S> {
    pub fn new(
        saga_id: SagaId,
        step_id: SagaStepId,
        state: S,
        correlation: CorrelationContext,
    ) -> Self {
        Self {
            saga_id,
            step_id,
            state,
            correlation,
        }
    }

    pub fn saga_id(&self) -> &SagaId {
        &self.saga_id
    }

    pub fn step_id(&self) -> &SagaStepId {
        &self.step_id
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    /// The correlation context of the flow that triggered the step.
    pub fn correlation(&self) -> &CorrelationContext {
        &self.correlation
    }

    pub fn into_state(self) -> S {
        self.state
    }
}

/// Failure reported by a step's execute or compensate action.
#[derive(Debug, Error)]
pub enum StepError {
    /// The step refused to proceed for a business reason (e.g. a declined card).
    #[error("Step rejected: {0}")]
    Rejected(String),

    /// The step failed unexpectedly.
    #[error("Step failed: {0}")]
    Failed(#[source] BoxError),

    /// The step aborted before invoking its side effect.
    #[error("Step cancelled")]
    Cancelled,
}

impl StepError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        StepError::Rejected(reason.into())
    }

    pub fn failed(error: impl Into<BoxError>) -> Self {
        StepError::Failed(error.into())
    }

    /// Returns true for unexpected failures a retry policy may re-attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Failed(_))
    }

    /// Human-readable reason recorded on the saga instance.
    pub fn reason(&self) -> String {
        match self {
            StepError::Rejected(reason) => reason.clone(),
            StepError::Failed(error) => error.to_string(),
            StepError::Cancelled => "cancelled".to_string(),
        }
    }
}
