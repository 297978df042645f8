//! Backend selection.
//!
//! Saga state needs point lookups by saga id, so only backends that can serve
//! them are accepted. Anything else (a message broker used as a pub/sub bus,
//! for instance) is rejected when the store is opened rather than failing on
//! the first load.

use std::str::FromStr;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;

use crate::{
    InMemorySagaStateStore, PostgresSagaStateStore, Result, SagaStateStore, StateStoreError,
};

/// Kind of state store backend named in configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Postgres,
    /// Any other backend name, kept for error reporting.
    Other(String),
}

impl BackendKind {
    /// Returns true if the backend can load a record by saga id.
    pub fn supports_point_lookups(&self) -> bool {
        matches!(self, BackendKind::Memory | BackendKind::Postgres)
    }

    pub fn as_str(&self) -> &str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::Postgres => "postgres",
            BackendKind::Other(name) => name,
        }
    }
}

impl FromStr for BackendKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" | "inmemory" => BackendKind::Memory,
            "postgres" | "postgresql" | "pg" => BackendKind::Postgres,
            other => BackendKind::Other(other.to_string()),
        })
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection settings for opening a store.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub database_url: Option<String>,
    pub max_connections: u32,
    /// Apply pending migrations after connecting (PostgreSQL only).
    pub run_migrations: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 5,
            run_migrations: true,
        }
    }
}

/// Opens the configured state store.
///
/// Fails with [`StateStoreError::UnsupportedBackend`] for backends without
/// durable point lookups.
pub async fn open_store(
    kind: &BackendKind,
    settings: &StoreSettings,
) -> Result<Arc<dyn SagaStateStore>> {
    if !kind.supports_point_lookups() {
        tracing::error!(backend = %kind, "Rejected state store backend");
        return Err(StateStoreError::UnsupportedBackend(kind.to_string()));
    }

    match kind {
        BackendKind::Memory => {
            tracing::info!("Using in-memory saga state store");
            Ok(Arc::new(InMemorySagaStateStore::new()))
        }
        BackendKind::Postgres => {
            let url = settings
                .database_url
                .as_deref()
                .ok_or(StateStoreError::MissingSetting("DATABASE_URL"))?;

            let pool = PgPoolOptions::new()
                .max_connections(settings.max_connections)
                .connect(url)
                .await?;
            let store = PostgresSagaStateStore::new(pool);

            if settings.run_migrations {
                store.run_migrations().await?;
            }

            tracing::info!(
                max_connections = settings.max_connections,
                "Using PostgreSQL saga state store"
            );
            Ok(Arc::new(store))
        }
        BackendKind::Other(name) => Err(StateStoreError::UnsupportedBackend(name.clone())),
    }
}
