//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p state-store --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use sqlx::PgPool;
use state_store::{
    PostgresSagaStateStore, SagaId, SagaRecord, SagaStateStore, SagaStateStoreExt,
    SaveOptions, StateStoreError, Version, Visibility,
};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();

            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_saga_states_table.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();

            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresSagaStateStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE saga_states")
        .execute(&pool)
        .await
        .unwrap();

    PostgresSagaStateStore::new(pool)
}

fn create_test_record(saga_id: &SagaId, step: &str) -> SagaRecord {
    SagaRecord::new(
        saga_id.clone(),
        "TestSaga",
        serde_json::json!({"status": "Running", "executed": [step]}),
    )
}

#[tokio::test]
async fn test_save_and_load_record() {
    let store = get_test_store().await;
    let saga_id = SagaId::new();

    let version = store
        .save(create_test_record(&saga_id, "a"), SaveOptions::expect_new())
        .await
        .unwrap();
    assert_eq!(version, Version::first());

    let loaded = store.load(&saga_id).await.unwrap().unwrap();
    assert_eq!(loaded.saga_id, saga_id);
    assert_eq!(loaded.saga_type, "TestSaga");
    assert_eq!(loaded.version, Version::first());
    assert_eq!(loaded.state["executed"][0], "a");
}

#[tokio::test]
async fn test_load_missing_record() {
    let store = get_test_store().await;
    assert!(store.load(&SagaId::new()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_duplicate_create_conflicts() {
    let store = get_test_store().await;
    let saga_id = SagaId::new();

    store
        .save(create_test_record(&saga_id, "a"), SaveOptions::expect_new())
        .await
        .unwrap();

    let result = store
        .save(create_test_record(&saga_id, "b"), SaveOptions::expect_new())
        .await;

    assert!(matches!(
        result,
        Err(StateStoreError::ConcurrencyConflict { expected, actual, .. })
            if expected == Version::initial() && actual == Version::first()
    ));
}

#[tokio::test]
async fn test_stale_update_conflicts_and_keeps_winner() {
    let store = get_test_store().await;
    let saga_id = SagaId::new();

    store
        .save(create_test_record(&saga_id, "a"), SaveOptions::expect_new())
        .await
        .unwrap();
    store
        .save(
            create_test_record(&saga_id, "b"),
            SaveOptions::expect_version(Version::first()),
        )
        .await
        .unwrap();

    let result = store
        .save(
            create_test_record(&saga_id, "stale"),
            SaveOptions::expect_version(Version::first()),
        )
        .await;
    assert!(result.unwrap_err().is_conflict());

    let loaded = store.load(&saga_id).await.unwrap().unwrap();
    assert_eq!(loaded.version, Version::new(2));
    assert_eq!(loaded.state["executed"][0], "b");
}

#[tokio::test]
async fn test_concurrent_updates_have_one_winner() {
    let store = get_test_store().await;
    let saga_id = SagaId::new();

    store
        .save(create_test_record(&saga_id, "a"), SaveOptions::expect_new())
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..5 {
        let store = store.clone();
        let saga_id = saga_id.clone();
        handles.push(tokio::spawn(async move {
            store
                .save(
                    create_test_record(&saga_id, &format!("b{i}")),
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
async fn test_unchecked_save_upserts() {
    let store = get_test_store().await;
    let saga_id = SagaId::new();

    let v1 = store
        .save(create_test_record(&saga_id, "a"), SaveOptions::new())
        .await
        .unwrap();
    let v2 = store
        .save(create_test_record(&saga_id, "b"), SaveOptions::new())
        .await
        .unwrap();

    assert_eq!(v1, Version::first());
    assert_eq!(v2, Version::new(2));
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let store = get_test_store().await;
    let saga_id = SagaId::new();

    store
        .save(create_test_record(&saga_id, "a"), SaveOptions::expect_new())
        .await
        .unwrap();
    assert!(store.exists(&saga_id).await.unwrap());

    store.delete(&saga_id).await.unwrap();
    store.delete(&saga_id).await.unwrap();
    assert!(!store.exists(&saga_id).await.unwrap());
}

#[tokio::test]
async fn test_typed_state_extension() {
    let store = get_test_store().await;
    let saga_id = SagaId::from("order-1001");

    let state = serde_json::json!({"order": 1001, "paid": false});
    store
        .save_state(&saga_id, "OrderSaga", &state, SaveOptions::expect_new())
        .await
        .unwrap();

    let (loaded, version): (serde_json::Value, Version) =
        store.load_state(&saga_id).await.unwrap().unwrap();
    assert_eq!(loaded, state);
    assert_eq!(version, Version::first());
}

#[tokio::test]
async fn test_reports_shared_visibility() {
    let store = get_test_store().await;
    assert_eq!(store.capabilities().visibility, Visibility::Shared);
}
