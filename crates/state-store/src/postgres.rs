use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::{
    Result, SagaId, SagaRecord, StateStoreError, Version,
    store::{SagaStateStore, SaveOptions, StoreCapabilities, Visibility},
};

/// PostgreSQL-backed saga state store.
///
/// One row per saga instance in `saga_states`. Versioned saves are single
/// conditional statements, so the compare-and-swap holds across every process
/// sharing the database.
#[derive(Clone)]
pub struct PostgresSagaStateStore {
    pool: PgPool,
}

impl PostgresSagaStateStore {
    /// Creates a new PostgreSQL state store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_record(row: PgRow) -> Result<SagaRecord> {
        Ok(SagaRecord {
            saga_id: SagaId::from(row.try_get::<String, _>("saga_id")?),
            saga_type: row.try_get("saga_type")?,
            version: Version::new(row.try_get("version")?),
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
            state: row.try_get("state")?,
        })
    }

    async fn current_version(&self, saga_id: &SagaId) -> Result<Version> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM saga_states WHERE saga_id = $1")
                .bind(saga_id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        Ok(Version::new(version.unwrap_or(0)))
    }

    async fn insert_new(&self, record: &SagaRecord, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            INSERT INTO saga_states (saga_id, saga_type, version, updated_at, state)
            VALUES ($1, $2, 1, $3, $4)
            ON CONFLICT (saga_id) DO NOTHING
            "#,
        )
        .bind(record.saga_id.as_str())
        .bind(&record.saga_type)
        .bind(now)
        .bind(&record.state)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn update_expected(
        &self,
        record: &SagaRecord,
        expected: Version,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE saga_states
            SET saga_type = $2, version = version + 1, updated_at = $3, state = $4
            WHERE saga_id = $1 AND version = $5
            "#,
        )
        .bind(record.saga_id.as_str())
        .bind(&record.saga_type)
        .bind(now)
        .bind(&record.state)
        .bind(expected.as_i64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn upsert(&self, record: &SagaRecord, now: DateTime<Utc>) -> Result<Version> {
        let version: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO saga_states (saga_id, saga_type, version, updated_at, state)
            VALUES ($1, $2, 1, $3, $4)
            ON CONFLICT (saga_id) DO UPDATE SET
                saga_type = EXCLUDED.saga_type,
                version = saga_states.version + 1,
                updated_at = EXCLUDED.updated_at,
                state = EXCLUDED.state
            RETURNING version
            "#,
        )
        .bind(record.saga_id.as_str())
        .bind(&record.saga_type)
        .bind(now)
        .bind(&record.state)
        .fetch_one(&self.pool)
        .await?;

        Ok(Version::new(version))
    }
}

#[async_trait]
impl SagaStateStore for PostgresSagaStateStore {
    #[tracing::instrument(skip(self), fields(saga_id = %saga_id))]
    async fn load(&self, saga_id: &SagaId) -> Result<Option<SagaRecord>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT saga_id, saga_type, version, updated_at, state
            FROM saga_states
            WHERE saga_id = $1
            "#,
        )
        .bind(saga_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record).transpose()
    }

    #[tracing::instrument(skip(self, record), fields(saga_id = %record.saga_id))]
    async fn save(&self, record: SagaRecord, options: SaveOptions) -> Result<Version> {
        let now = Utc::now();

        let Some(expected) = options.expected_version else {
            return self.upsert(&record, now).await;
        };

        let affected = if expected == Version::initial() {
            self.insert_new(&record, now).await?
        } else {
            self.update_expected(&record, expected, now).await?
        };

        if affected == 0 {
            let actual = self.current_version(&record.saga_id).await?;
            return Err(StateStoreError::ConcurrencyConflict {
                saga_id: record.saga_id,
                expected,
                actual,
            });
        }

        Ok(expected.next())
    }

    #[tracing::instrument(skip(self), fields(saga_id = %saga_id))]
    async fn delete(&self, saga_id: &SagaId) -> Result<()> {
        sqlx::query("DELETE FROM saga_states WHERE saga_id = $1")
            .bind(saga_id.as_str())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            durable_point_lookups: true,
            visibility: Visibility::Shared,
        }
    }
}
