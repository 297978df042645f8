//! Host error types.

use thiserror::Error;

/// Errors raised while configuring or running the host.
#[derive(Debug, Error)]
pub enum HostError {
    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The state store could not be opened.
    #[error("State store error: {0}")]
    Store(#[from] state_store::StateStoreError),

    /// Saga wiring failed at start-up.
    #[error("Saga configuration error: {0}")]
    Saga(#[from] saga::ConfigError),

    /// Dispatch through the pipeline failed.
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] pipeline::PipelineError),

    /// Telemetry could not be installed.
    #[error("Telemetry error: {0}")]
    Telemetry(String),

    /// An inbound message lacks a required header.
    #[error("Missing header '{0}'")]
    MissingHeader(&'static str),

    /// An inbound message names an event type with no route.
    #[error("Unknown event type '{0}'")]
    UnknownEventType(String),

    /// An inbound message could not be decoded.
    #[error("Malformed message: {0}")]
    Decode(#[from] serde_json::Error),

    /// Reading the inbound stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HostError>;
