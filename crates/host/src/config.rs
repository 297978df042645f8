//! Host configuration loaded from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use state_store::{BackendKind, StoreSettings};

use crate::error::{HostError, Result};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Host configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `STATE_STORE` — saga state backend (default: `"memory"`)
/// - `DATABASE_URL` — PostgreSQL connection string, required for `postgres`
/// - `DATABASE_MAX_CONNECTIONS` — pool size (default: `5`)
/// - `SAGA_MAX_CONFLICT_RETRIES` — retries when creating an instance races (default: `3`)
/// - `STEP_TIMEOUT_MS` — per-attempt timeout for saga steps (default: none)
/// - `METRICS_ADDR` — Prometheus listener (default: `"0.0.0.0:9000"`)
/// - `RUST_LOG` — tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT` — `"json"` for JSON lines, anything else for human output
#[derive(Debug, Clone)]
pub struct Config {
    pub state_store: BackendKind,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub max_conflict_retries: u32,
    pub step_timeout: Option<Duration>,
    pub metrics_addr: SocketAddr,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let state_store = lookup("STATE_STORE")
            .and_then(|value| value.parse().ok())
            .unwrap_or(defaults.state_store);

        let metrics_addr = match lookup("METRICS_ADDR") {
            Some(addr) => addr
                .parse()
                .map_err(|_| HostError::Config(format!("invalid METRICS_ADDR '{addr}'")))?,
            None => defaults.metrics_addr,
        };

        let log_format = match lookup("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Ok(Self {
            state_store,
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            database_max_connections: parse_or(
                &lookup,
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,
            max_conflict_retries: parse_or(
                &lookup,
                "SAGA_MAX_CONFLICT_RETRIES",
                defaults.max_conflict_retries,
            )?,
            step_timeout: lookup("STEP_TIMEOUT_MS")
                .map(|ms| {
                    ms.parse::<u64>()
                        .map(Duration::from_millis)
                        .map_err(|_| HostError::Config(format!("invalid STEP_TIMEOUT_MS '{ms}'")))
                })
                .transpose()?,
            metrics_addr,
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format,
        })
    }

    /// Settings for opening the configured state store.
    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            database_url: self.database_url.clone(),
            max_connections: self.database_max_connections,
            run_migrations: true,
        }
    }
}

fn parse_or<F>(lookup: &F, key: &str, default: u32) -> Result<u32>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value
            .parse()
            .map_err(|_| HostError::Config(format!("invalid {key} '{value}'"))),
        None => Ok(default),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_store: BackendKind::Memory,
            database_url: None,
            database_max_connections: 5,
            max_conflict_retries: 3,
            step_timeout: None,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}
