//! Saga lifecycle notifications.
//!
//! Published through a [`NotificationPublisher<SagaLifecycle>`] after the
//! matching state change has been persisted. Handlers are the operator
//! channel for compensation failures: alerting, dead-lettering or manual
//! replay all hang off [`SagaLifecycle::CompensationStepFailed`] and
//! [`SagaLifecycle::SagaFailed`].
//!
//! [`NotificationPublisher<SagaLifecycle>`]: pipeline::NotificationPublisher

use chrono::{DateTime, Utc};
use common::SagaId;
use pipeline::Notification;
use serde::{Deserialize, Serialize};

use crate::step::SagaStepId;

/// Something that happened to a saga instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaLifecycle {
    /// A forward step completed and was recorded.
    StepCompleted(StepData),

    /// A forward step failed.
    StepFailed(StepFailedData),

    /// Compensation started.
    CompensationStarted(CompensationData),

    /// A compensation completed and was recorded.
    CompensationStepCompleted(StepData),

    /// A compensation failed; the instance is now `Failed`.
    CompensationStepFailed(StepFailedData),

    /// Every step executed.
    SagaCompleted(SagaFinishedData),

    /// Every executed step was compensated.
    SagaCompensated(SagaFinishedData),

    /// The instance needs operator intervention.
    SagaFailed(SagaFailedData),
}

impl SagaLifecycle {
    pub fn event_type(&self) -> &'static str {
        match self {
            SagaLifecycle::StepCompleted(_) => "StepCompleted",
            SagaLifecycle::StepFailed(_) => "StepFailed",
            SagaLifecycle::CompensationStarted(_) => "CompensationStarted",
            SagaLifecycle::CompensationStepCompleted(_) => "CompensationStepCompleted",
            SagaLifecycle::CompensationStepFailed(_) => "CompensationStepFailed",
            SagaLifecycle::SagaCompleted(_) => "SagaCompleted",
            SagaLifecycle::SagaCompensated(_) => "SagaCompensated",
            SagaLifecycle::SagaFailed(_) => "SagaFailed",
        }
    }

    pub fn saga_id(&self) -> &SagaId {
        match self {
            SagaLifecycle::StepCompleted(data) | SagaLifecycle::CompensationStepCompleted(data) => {
                &data.saga_id
            }
            SagaLifecycle::StepFailed(data) | SagaLifecycle::CompensationStepFailed(data) => {
                &data.saga_id
            }
            SagaLifecycle::CompensationStarted(data) => &data.saga_id,
            SagaLifecycle::SagaCompleted(data) | SagaLifecycle::SagaCompensated(data) => {
                &data.saga_id
            }
            SagaLifecycle::SagaFailed(data) => &data.saga_id,
        }
    }
}

impl Notification for SagaLifecycle {
    fn name(&self) -> &'static str {
        self.event_type()
    }
}

/// Data for step completion notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepData {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub step: SagaStepId,
}

/// Data for step failure notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFailedData {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub step: SagaStepId,
    /// Error message describing the failure.
    pub error: String,
}

/// Data for CompensationStarted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationData {
    pub saga_id: SagaId,
    pub saga_type: String,
    /// The step whose failure triggered compensation.
    pub from_step: SagaStepId,
}

/// Data for SagaCompleted and SagaCompensated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaFinishedData {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub finished_at: DateTime<Utc>,
}

/// Data for SagaFailed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaFailedData {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

// Convenience constructors
impl SagaLifecycle {
    pub fn step_completed(saga_id: &SagaId, saga_type: &str, step: &SagaStepId) -> Self {
        SagaLifecycle::StepCompleted(StepData::new(saga_id, saga_type, step))
    }

    pub fn step_failed(
        saga_id: &SagaId,
        saga_type: &str,
        step: &SagaStepId,
        error: impl Into<String>,
    ) -> Self {
        SagaLifecycle::StepFailed(StepFailedData::new(saga_id, saga_type, step, error))
    }

    pub fn compensation_started(saga_id: &SagaId, saga_type: &str, from_step: &SagaStepId) -> Self {
        SagaLifecycle::CompensationStarted(CompensationData {
            saga_id: saga_id.clone(),
            saga_type: saga_type.to_string(),
            from_step: from_step.clone(),
        })
    }

    pub fn compensation_step_completed(
        saga_id: &SagaId,
        saga_type: &str,
        step: &SagaStepId,
    ) -> Self {
        SagaLifecycle::CompensationStepCompleted(StepData::new(saga_id, saga_type, step))
    }

    pub fn compensation_step_failed(
        saga_id: &SagaId,
        saga_type: &str,
        step: &SagaStepId,
        error: impl Into<String>,
    ) -> Self {
        SagaLifecycle::CompensationStepFailed(StepFailedData::new(saga_id, saga_type, step, error))
    }

    pub fn saga_completed(saga_id: &SagaId, saga_type: &str) -> Self {
        SagaLifecycle::SagaCompleted(SagaFinishedData::now(saga_id, saga_type))
    }

    pub fn saga_compensated(saga_id: &SagaId, saga_type: &str) -> Self {
        SagaLifecycle::SagaCompensated(SagaFinishedData::now(saga_id, saga_type))
    }

    pub fn saga_failed(saga_id: &SagaId, saga_type: &str, reason: impl Into<String>) -> Self {
        SagaLifecycle::SagaFailed(SagaFailedData {
            saga_id: saga_id.clone(),
            saga_type: saga_type.to_string(),
            reason: reason.into(),
            failed_at: Utc::now(),
        })
    }
}

impl StepData {
    fn new(saga_id: &SagaId, saga_type: &str, step: &SagaStepId) -> Self {
        Self {
            saga_id: saga_id.clone(),
            saga_type: saga_type.to_string(),
            step: step.clone(),
        }
    }
}

impl StepFailedData {
    fn new(saga_id: &SagaId, saga_type: &str, step: &SagaStepId, error: impl Into<String>) -> Self {
        Self {
            saga_id: saga_id.clone(),
            saga_type: saga_type.to_string(),
            step: step.clone(),
            error: error.into(),
        }
    }
}

impl SagaFinishedData {
    fn now(saga_id: &SagaId, saga_type: &str) -> Self {
        Self {
            saga_id: saga_id.clone(),
            saga_type: saga_type.to_string(),
            finished_at: Utc::now(),
        }
    }
}
