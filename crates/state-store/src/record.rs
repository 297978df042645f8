use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{SagaId, Version};

/// The persisted state of one saga instance.
///
/// The store treats `state` as an opaque JSON blob; the orchestrator decides
/// what goes in it (status, executed steps, application payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaRecord {
    /// The saga instance this record belongs to.
    pub saga_id: SagaId,

    /// The saga definition backing the instance (e.g., "OrderSaga").
    pub saga_type: String,

    /// The version of the record. Assigned by the store on save.
    pub version: Version,

    /// When the record was last written.
    pub updated_at: DateTime<Utc>,

    /// The serialized saga state.
    pub state: serde_json::Value,
}

impl SagaRecord {
    /// Creates a new record ready to be saved.
    pub fn new(saga_id: SagaId, saga_type: impl Into<String>, state: serde_json::Value) -> Self {
        Self {
            saga_id,
            saga_type: saga_type.into(),
            version: Version::initial(),
            updated_at: Utc::now(),
            state,
        }
    }

    /// Creates a record from a serializable state.
    pub fn from_state<T: Serialize>(
        saga_id: SagaId,
        saga_type: impl Into<String>,
        state: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(saga_id, saga_type, serde_json::to_value(state)?))
    }

    /// Deserializes the record state into a concrete type.
    pub fn into_state<T: for<'de> Deserialize<'de>>(self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.state)
    }

    /// Gets a reference to the state as JSON.
    pub fn state_ref(&self) -> &serde_json::Value {
        &self.state
    }
}
