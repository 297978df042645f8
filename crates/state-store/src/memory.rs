use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{
    Result, SagaId, SagaRecord, StateStoreError, Version,
    store::{SagaStateStore, SaveOptions, StoreCapabilities, Visibility},
};

/// In-memory saga state store.
///
/// Provides the same compare-and-swap semantics as the PostgreSQL store, but
/// records are only visible inside the current process and are lost on exit.
#[derive(Clone, Default)]
pub struct InMemorySagaStateStore {
    records: Arc<RwLock<HashMap<SagaId, SagaRecord>>>,
}

impl InMemorySagaStateStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored records.
    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }

    /// Removes every record.
    pub async fn clear(&self) {
        self.records.write().await.clear();
    }
}

#[async_trait]
impl SagaStateStore for InMemorySagaStateStore {
    async fn load(&self, saga_id: &SagaId) -> Result<Option<SagaRecord>> {
        Ok(self.records.read().await.get(saga_id).cloned())
    }

    async fn save(&self, mut record: SagaRecord, options: SaveOptions) -> Result<Version> {
        let mut records = self.records.write().await;

        let current_version = records
            .get(&record.saga_id)
            .map(|r| r.version)
            .unwrap_or(Version::initial());

        if let Some(expected) = options.expected_version
            && current_version != expected
        {
            return Err(StateStoreError::ConcurrencyConflict {
                saga_id: record.saga_id,
                expected,
                actual: current_version,
            });
        }

        let new_version = current_version.next();
        record.version = new_version;
        record.updated_at = Utc::now();
        records.insert(record.saga_id.clone(), record);

        Ok(new_version)
    }

    async fn delete(&self, saga_id: &SagaId) -> Result<()> {
        self.records.write().await.remove(saga_id);
        Ok(())
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            durable_point_lookups: true,
            visibility: Visibility::SingleProcess,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SagaStateStoreExt;

    fn create_test_record(saga_id: &str, step: &str) -> SagaRecord {
        SagaRecord::new(
            SagaId::from(saga_id),
            "TestSaga",
            serde_json::json!({"executed": [step]}),
        )
    }

    #[tokio::test]
    async fn test_save_and_load_record() {
        let store = InMemorySagaStateStore::new();

        let version = store
            .save(create_test_record("s-1", "a"), SaveOptions::expect_new())
            .await
            .unwrap();
        assert_eq!(version, Version::first());

        let loaded = store.load(&SagaId::from("s-1")).await.unwrap().unwrap();
        assert_eq!(loaded.version, Version::first());
        assert_eq!(loaded.saga_type, "TestSaga");
        assert_eq!(loaded.state["executed"][0], "a");
    }

    #[tokio::test]
    async fn test_load_missing_record() {
        let store = InMemorySagaStateStore::new();
        let result = store.load(&SagaId::from("missing")).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_concurrency_conflict_on_wrong_version() {
        let store = InMemorySagaStateStore::new();

        store
            .save(create_test_record("s-1", "a"), SaveOptions::expect_new())
            .await
            .unwrap();

        let result = store
            .save(create_test_record("s-1", "b"), SaveOptions::expect_new())
            .await;

        assert!(matches!(
            result,
            Err(StateStoreError::ConcurrencyConflict { expected, actual, .. })
                if expected == Version::initial() && actual == Version::first()
        ));

        // The losing write must not have replaced the record
        let loaded = store.load(&SagaId::from("s-1")).await.unwrap().unwrap();
        assert_eq!(loaded.state["executed"][0], "a");
    }

    #[tokio::test]
    async fn test_save_with_expected_version_increments() {
        let store = InMemorySagaStateStore::new();

        store
            .save(create_test_record("s-1", "a"), SaveOptions::expect_new())
            .await
            .unwrap();
        let version = store
            .save(
                create_test_record("s-1", "b"),
                SaveOptions::expect_version(Version::first()),
            )
            .await
            .unwrap();

        assert_eq!(version, Version::new(2));
    }

    #[tokio::test]
    async fn test_expected_version_on_absent_record_conflicts() {
        let store = InMemorySagaStateStore::new();

        let result = store
            .save(
                create_test_record("s-1", "a"),
                SaveOptions::expect_version(Version::new(3)),
            )
            .await;

        assert!(result.unwrap_err().is_conflict());
        assert_eq!(store.record_count().await, 0);
    }

    #[tokio::test]
    async fn test_unchecked_save_overwrites() {
        let store = InMemorySagaStateStore::new();

        store
            .save(create_test_record("s-1", "a"), SaveOptions::new())
            .await
            .unwrap();
        let version = store
            .save(create_test_record("s-1", "b"), SaveOptions::new())
            .await
            .unwrap();

        assert_eq!(version, Version::new(2));
    }

    #[tokio::test]
    async fn test_concurrent_saves_from_same_version_have_one_winner() {
        let store = InMemorySagaStateStore::new();
        store
            .save(create_test_record("s-1", "a"), SaveOptions::expect_new())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .save(
                        create_test_record("s-1", &format!("b{i}")),
                        SaveOptions::expect_version(Version::first()),
                    )
                    .await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_delete_removes_record_and_is_idempotent() {
        let store = InMemorySagaStateStore::new();
        let saga_id = SagaId::from("s-1");

        store
            .save(create_test_record("s-1", "a"), SaveOptions::expect_new())
            .await
            .unwrap();
        assert!(store.exists(&saga_id).await.unwrap());

        store.delete(&saga_id).await.unwrap();
        assert!(!store.exists(&saga_id).await.unwrap());

        store.delete(&saga_id).await.unwrap();
        assert_eq!(store.record_count().await, 0);
    }

    #[tokio::test]
    async fn test_typed_state_roundtrip() {
        let store = InMemorySagaStateStore::new();
        let saga_id = SagaId::from("s-1");

        let state: Vec<String> = vec!["reserve".into(), "charge".into()];
        store
            .save_state(&saga_id, "TestSaga", &state, SaveOptions::expect_new())
            .await
            .unwrap();

        let (loaded, version): (Vec<String>, Version) =
            store.load_state(&saga_id).await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(version, Version::first());
    }

    #[test]
    fn test_reports_single_process_visibility() {
        let store = InMemorySagaStateStore::new();
        let caps = store.capabilities();
        assert!(caps.durable_point_lookups);
        assert_eq!(caps.visibility, Visibility::SingleProcess);
    }
}
