use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

use crate::{Result, SagaId, SagaRecord, Version};

/// Options for saving a saga record.
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Expected version of the stored record for optimistic concurrency control.
    /// If None, no version check is performed and the last write wins (use with caution).
    pub expected_version: Option<Version>,
}

impl SaveOptions {
    /// Creates options with no version check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options expecting the record to be at a specific version.
    pub fn expect_version(version: Version) -> Self {
        Self {
            expected_version: Some(version),
        }
    }

    /// Creates options expecting the record to not exist (new saga instance).
    pub fn expect_new() -> Self {
        Self {
            expected_version: Some(Version::initial()),
        }
    }
}

/// Who can observe a write made through a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Writes are visible only inside the current process.
    SingleProcess,
    /// Writes are visible to every process sharing the backend.
    Shared,
}

/// Consistency model of a store implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCapabilities {
    /// Whether a saved record can later be loaded by saga id.
    pub durable_point_lookups: bool,
    /// Scope in which saves are visible.
    pub visibility: Visibility,
}

/// Core trait for saga state store implementations.
///
/// A store keeps at most one record per saga id. Every save is a versioned
/// compare-and-swap when `expected_version` is set: of two writers that loaded
/// the same version, exactly one succeeds and the other receives
/// `ConcurrencyConflict`. All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait SagaStateStore: Send + Sync {
    /// Loads the record for a saga instance.
    ///
    /// Returns None if the instance has never been saved or was deleted.
    async fn load(&self, saga_id: &SagaId) -> Result<Option<SagaRecord>>;

    /// Saves a record, replacing the previous one.
    ///
    /// Returns the new version of the record (previous version + 1).
    async fn save(&self, record: SagaRecord, options: SaveOptions) -> Result<Version>;

    /// Deletes the record for a saga instance. Deleting an absent id is a no-op.
    async fn delete(&self, saga_id: &SagaId) -> Result<()>;

    /// Describes the consistency model of this store.
    fn capabilities(&self) -> StoreCapabilities;
}

/// Extension trait providing typed convenience methods for state stores.
#[async_trait]
pub trait SagaStateStoreExt: SagaStateStore {
    /// Loads and deserializes the state of a saga instance together with its version.
    async fn load_state<T>(&self, saga_id: &SagaId) -> Result<Option<(T, Version)>>
    where
        T: DeserializeOwned + Send,
    {
        match self.load(saga_id).await? {
            Some(record) => {
                let version = record.version;
                Ok(Some((record.into_state()?, version)))
            }
            None => Ok(None),
        }
    }

    /// Serializes and saves the state of a saga instance.
    async fn save_state<T>(
        &self,
        saga_id: &SagaId,
        saga_type: &str,
        state: &T,
        options: SaveOptions,
    ) -> Result<Version>
    where
        T: Serialize + Sync,
    {
        let record = SagaRecord::from_state(saga_id.clone(), saga_type, state)?;
        self.save(record, options).await
    }

    /// Checks if a saga instance has a stored record.
    async fn exists(&self, saga_id: &SagaId) -> Result<bool> {
        Ok(self.load(saga_id).await?.is_some())
    }
}

// Blanket implementation for all SagaStateStore implementations
impl<T: SagaStateStore + ?Sized> SagaStateStoreExt for T {}
