use thiserror::Error;

use crate::{SagaId, Version};

/// Errors that can occur when interacting with a saga state store.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// A concurrency conflict occurred when saving state.
    /// The expected version did not match the stored version.
    #[error(
        "Concurrency conflict for saga {saga_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        saga_id: SagaId,
        expected: Version,
        actual: Version,
    },

    /// The configured backend cannot serve durable point lookups by saga id.
    #[error("Unsupported state store backend '{0}': durable point lookups are required")]
    UnsupportedBackend(String),

    /// The backend needs a setting that was not provided.
    #[error("Missing state store setting: {0}")]
    MissingSetting(&'static str),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StateStoreError {
    /// Returns true if the error is an optimistic concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateStoreError::ConcurrencyConflict { .. })
    }

    /// Returns true if the backend failed in a way a later attempt may not.
    pub fn is_transient(&self) -> bool {
        matches!(self, StateStoreError::Database(_))
    }
}

/// Result type for state store operations.
pub type Result<T> = std::result::Result<T, StateStoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let conflict = StateStoreError::ConcurrencyConflict {
            saga_id: SagaId::from("s-1"),
            expected: Version::first(),
            actual: Version::new(2),
        };
        assert!(conflict.is_conflict());
        assert!(!conflict.is_transient());

        assert!(StateStoreError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StateStoreError::MissingSetting("DATABASE_URL").is_transient());
    }
}
