//! Logging and metrics initialisation.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{Config, LogFormat};
use crate::error::{HostError, Result};

/// Installs the tracing subscriber and the Prometheus exporter.
///
/// The exporter serves `/metrics` on `config.metrics_addr`. Must be called
/// from within a tokio runtime.
pub fn init(config: &Config) -> Result<()> {
    init_tracing(config)?;

    PrometheusBuilder::new()
        .with_http_listener(config.metrics_addr)
        .install()
        .map_err(|e| HostError::Telemetry(e.to_string()))?;

    tracing::info!(addr = %config.metrics_addr, "prometheus exporter listening");
    Ok(())
}

fn init_tracing(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    installed.map_err(|e| HostError::Telemetry(e.to_string()))
}
