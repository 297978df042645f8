//! Persisted saga instance.

use chrono::{DateTime, Utc};
use common::SagaId;
use serde::{Deserialize, Serialize};

use crate::status::SagaStatus;
use crate::step::SagaStepId;

/// Why an instance left the happy path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaFailure {
    /// The step whose action failed.
    pub step: SagaStepId,
    /// Error message describing the failure.
    pub reason: String,
    /// True when the failing action was a compensation.
    pub during_compensation: bool,
}

/// One running or finished instance of a saga.
///
/// Tracks the executed steps (for replay and compensation), the compensated
/// steps and the application state accumulated by the steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaInstance<S> {
    saga_id: SagaId,
    saga_type: String,
    status: SagaStatus,
    executed_steps: Vec<SagaStepId>,
    compensated_steps: Vec<SagaStepId>,
    failure: Option<SagaFailure>,
    state: S,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<S> SagaInstance<S> {
    /// Creates a fresh instance in `Running` status.
    pub fn new(saga_id: SagaId, saga_type: impl Into<String>, state: S) -> Self {
        let now = Utc::now();
        Self {
            saga_id,
            saga_type: saga_type.into(),
            status: SagaStatus::Running,
            executed_steps: Vec::new(),
            compensated_steps: Vec::new(),
            failure: None,
            state,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn saga_id(&self) -> &SagaId {
        &self.saga_id
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    /// Executed step ids, in execution order.
    pub fn executed_steps(&self) -> &[SagaStepId] {
        &self.executed_steps
    }

    /// Compensated step ids, in compensation order.
    pub fn compensated_steps(&self) -> &[SagaStepId] {
        &self.compensated_steps
    }

    pub fn failure(&self) -> Option<&SagaFailure> {
        self.failure.as_ref()
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn into_state(self) -> S {
        self.state
    }

    pub fn has_executed(&self, step: &SagaStepId) -> bool {
        self.executed_steps.contains(step)
    }

    /// Executed steps still awaiting compensation, in the order they must be
    /// compensated.
    pub fn pending_compensations(&self) -> Vec<SagaStepId> {
        self.executed_steps
            .iter()
            .rev()
            .skip(self.compensated_steps.len())
            .cloned()
            .collect()
    }

    pub(crate) fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    pub(crate) fn set_state(&mut self, state: S) {
        self.state = state;
    }

    pub(crate) fn record_executed(&mut self, step: SagaStepId) {
        self.executed_steps.push(step);
    }

    pub(crate) fn record_compensated(&mut self, step: SagaStepId) {
        self.compensated_steps.push(step);
    }

    pub(crate) fn complete(&mut self) {
        self.status = SagaStatus::Completed;
    }

    pub(crate) fn begin_compensation(&mut self, failure: SagaFailure) {
        self.status = SagaStatus::Compensating;
        self.failure = Some(failure);
    }

    pub(crate) fn finish_compensation(&mut self) {
        self.status = SagaStatus::Compensated;
    }

    pub(crate) fn fail(&mut self, failure: SagaFailure) {
        self.status = SagaStatus::Failed;
        self.failure = Some(failure);
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> SagaInstance<u32> {
        SagaInstance::new(SagaId::from("saga-1"), "OrderSaga", 0)
    }

    #[test]
    fn test_new_instance_is_running() {
        let saga = instance();
        assert_eq!(saga.status(), SagaStatus::Running);
        assert_eq!(saga.saga_type(), "OrderSaga");
        assert!(saga.executed_steps().is_empty());
        assert!(saga.failure().is_none());
        assert_eq!(saga.started_at(), saga.updated_at());
    }

    #[test]
    fn test_pending_compensations_reverse_executed_steps() {
        let mut saga = instance();
        saga.record_executed("a".into());
        saga.record_executed("b".into());
        saga.record_executed("c".into());
        let expected: Vec<SagaStepId> = vec!["c".into(), "b".into(), "a".into()];
        assert_eq!(saga.pending_compensations(), expected);

        saga.record_compensated("c".into());
        let expected: Vec<SagaStepId> = vec!["b".into(), "a".into()];
        assert_eq!(saga.pending_compensations(), expected);
    }

    #[test]
    fn test_compensation_lifecycle() {
        let mut saga = instance();
        saga.record_executed("a".into());
        saga.begin_compensation(SagaFailure {
            step: "b".into(),
            reason: "declined".to_string(),
            during_compensation: false,
        });
        assert_eq!(saga.status(), SagaStatus::Compensating);

        saga.record_compensated("a".into());
        saga.finish_compensation();
        assert_eq!(saga.status(), SagaStatus::Compensated);
        assert!(saga.pending_compensations().is_empty());
        assert_eq!(saga.failure().map(|f| f.step.as_str()), Some("b"));
    }

    #[test]
    fn test_serialization_roundtrip() {
        let mut saga = instance();
        saga.record_executed("a".into());
        *saga.state_mut() = 7;

        let json = serde_json::to_value(&saga).unwrap();
        assert_eq!(json["status"], "Running");
        assert_eq!(json["executed_steps"], serde_json::json!(["a"]));

        let back: SagaInstance<u32> = serde_json::from_value(json).unwrap();
        assert_eq!(back.executed_steps(), saga.executed_steps());
        assert_eq!(*back.state(), 7);
    }
}
