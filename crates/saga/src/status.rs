//! Saga status machine.

use serde::{Deserialize, Serialize};

/// The status of a saga instance in its lifecycle.
///
/// Status transitions:
/// ```text
/// Running ──┬──► Completed
///           └──► Compensating ──┬──► Compensated
///                               └──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaStatus {
    /// Forward steps are being executed.
    #[default]
    Running,

    /// Every step executed successfully (terminal).
    Completed,

    /// A step failed and executed steps are being compensated.
    Compensating,

    /// Every executed step was compensated (terminal).
    Compensated,

    /// A compensation failed (terminal, requires operator intervention).
    Failed,
}

impl SagaStatus {
    /// Returns true if forward step events may still be applied.
    pub fn accepts_forward_events(&self) -> bool {
        matches!(self, SagaStatus::Running)
    }

    /// Returns true if a compensation-direction event has work to do.
    pub fn accepts_compensation_events(&self) -> bool {
        matches!(self, SagaStatus::Running | SagaStatus::Compensating)
    }

    /// Returns true if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Failed
        )
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Running => "Running",
            SagaStatus::Completed => "Completed",
            SagaStatus::Compensating => "Compensating",
            SagaStatus::Compensated => "Compensated",
            SagaStatus::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_running() {
        assert_eq!(SagaStatus::default(), SagaStatus::Running);
    }

    #[test]
    fn test_accepts_forward_events() {
        assert!(SagaStatus::Running.accepts_forward_events());
        assert!(!SagaStatus::Completed.accepts_forward_events());
        assert!(!SagaStatus::Compensating.accepts_forward_events());
        assert!(!SagaStatus::Compensated.accepts_forward_events());
        assert!(!SagaStatus::Failed.accepts_forward_events());
    }

    #[test]
    fn test_accepts_compensation_events() {
        assert!(SagaStatus::Running.accepts_compensation_events());
        assert!(SagaStatus::Compensating.accepts_compensation_events());
        assert!(!SagaStatus::Completed.accepts_compensation_events());
        assert!(!SagaStatus::Compensated.accepts_compensation_events());
        assert!(!SagaStatus::Failed.accepts_compensation_events());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!SagaStatus::Running.is_terminal());
        assert!(!SagaStatus::Compensating.is_terminal());
        assert!(SagaStatus::Completed.is_terminal());
        assert!(SagaStatus::Compensated.is_terminal());
        assert!(SagaStatus::Failed.is_terminal());
    }

    #[test]
    fn test_display() {
        assert_eq!(SagaStatus::Running.to_string(), "Running");
        assert_eq!(SagaStatus::Completed.to_string(), "Completed");
        assert_eq!(SagaStatus::Compensating.to_string(), "Compensating");
        assert_eq!(SagaStatus::Compensated.to_string(), "Compensated");
        assert_eq!(SagaStatus::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_serialization() {
        let status = SagaStatus::Compensating;
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, "\"Compensating\"");
        let deserialized: SagaStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(status, deserialized);
    }
}
