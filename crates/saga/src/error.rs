//! Saga error types.

use common::SagaId;
use state_store::StateStoreError;
use thiserror::Error;

use crate::status::SagaStatus;
use crate::step::SagaStepId;

/// Wiring-time errors raised while building an orchestrator.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A saga declared no steps.
    #[error("Saga '{saga_type}' has no steps")]
    EmptySaga { saga_type: String },

    /// A saga declared the same step id twice.
    #[error("Saga '{saga_type}' declares step '{step}' more than once")]
    DuplicateStep { saga_type: String, step: SagaStepId },

    /// Two registrations share a saga type.
    #[error("Saga type '{0}' is registered more than once")]
    DuplicateSagaType(String),

    /// A route points at a step the saga does not declare.
    #[error("Event '{event_type}' routes to unknown step '{step}' of saga '{saga_type}'")]
    UnknownStep {
        saga_type: String,
        event_type: &'static str,
        step: SagaStepId,
    },

    /// An event type is routed more than once.
    #[error("Event '{event_type}' is routed more than once")]
    AmbiguousRoute { event_type: &'static str },

    /// The state store cannot serve durable point lookups.
    #[error("State store does not support durable point lookups")]
    UnsupportedStore,

    /// A consumed event type has no route.
    #[error("Event '{event_type}' is not routed to any saga")]
    MissingRoute { event_type: &'static str },
}

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State store error.
    #[error("State store error: {0}")]
    Store(#[from] StateStoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No saga is registered for the event type.
    #[error("Event '{event_type}' is not routed to any saga")]
    Unrouted { event_type: &'static str },

    /// No saga is registered under the saga type.
    #[error("Unknown saga type: {0}")]
    UnknownSagaType(String),

    /// A forward event arrived for a step that is not next in line.
    #[error("Saga {saga_id}: expected step '{expected}', got '{actual}'")]
    OutOfOrder {
        saga_id: SagaId,
        expected: SagaStepId,
        actual: SagaStepId,
    },

    /// A step failed and every executed step was compensated.
    #[error("Saga {saga_id}: step '{step}' failed: {reason}")]
    StepFailed {
        saga_id: SagaId,
        step: SagaStepId,
        reason: String,
    },

    /// A compensation failed; the instance is `Failed`.
    #[error("Saga {saga_id}: compensation of step '{step}' failed: {reason}")]
    CompensationFailed {
        saga_id: SagaId,
        step: SagaStepId,
        reason: String,
    },

    /// Another flow persisted the instance first.
    #[error("Saga {saga_id} was modified concurrently")]
    Concurrency { saga_id: SagaId },

    /// The saga has already been started.
    #[error("Saga {saga_id} has already been started ({status})")]
    AlreadyStarted { saga_id: SagaId, status: SagaStatus },

    /// The record stored under the saga id belongs to another saga type.
    #[error("Saga {saga_id} belongs to saga type '{found}', not '{expected}'")]
    SagaTypeMismatch {
        saga_id: SagaId,
        expected: String,
        found: String,
    },

    /// Saga instance not found.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// The instance is still active.
    #[error("Saga {saga_id} is not terminal ({status})")]
    NotTerminal { saga_id: SagaId, status: SagaStatus },

    /// The flow was cancelled before a step's side effect.
    #[error("Saga operation cancelled")]
    Cancelled,
}

impl SagaError {
    /// Returns true if a redelivery of the same message may succeed.
    ///
    /// Only lost races and database I/O qualify; a record that does not decode
    /// or a misconfigured backend fails the same way every time.
    pub fn is_retryable(&self) -> bool {
        match self {
            SagaError::Concurrency { .. } => true,
            SagaError::Store(e) => e.is_conflict() || e.is_transient(),
            _ => false,
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_converts() {
        let err: SagaError = ConfigError::AmbiguousRoute {
            event_type: "OrderPlaced",
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Configuration error: Event 'OrderPlaced' is routed more than once"
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(
            SagaError::Concurrency {
                saga_id: SagaId::from("s")
            }
            .is_retryable()
        );
        assert!(
            !SagaError::StepFailed {
                saga_id: SagaId::from("s"),
                step: "charge".into(),
                reason: "declined".into(),
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_only_lost_races_in_the_store_are_retryable() {
        let conflict = StateStoreError::ConcurrencyConflict {
            saga_id: SagaId::from("s"),
            expected: state_store::Version::first(),
            actual: state_store::Version::new(2),
        };
        assert!(SagaError::Store(conflict).is_retryable());

        let undecodable = serde_json::from_str::<u32>("\"not a number\"").unwrap_err();
        assert!(!SagaError::Store(StateStoreError::Serialization(undecodable)).is_retryable());
        assert!(!SagaError::Store(StateStoreError::MissingSetting("DATABASE_URL")).is_retryable());
        assert!(
            !SagaError::Store(StateStoreError::UnsupportedBackend("kafka".into())).is_retryable()
        );
        assert!(
            !SagaError::SagaTypeMismatch {
                saga_id: SagaId::from("s"),
                expected: "Trip".into(),
                found: "Shuttle".into(),
            }
            .is_retryable()
        );
    }
}
