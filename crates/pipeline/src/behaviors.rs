//! Cross-cutting behaviors: correlation scope and request logging.

use std::time::Instant;

use async_trait::async_trait;
use common::CorrelationContext;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::Result;
use crate::request::{Next, PipelineBehavior, Request};

/// Ensures the dispatch runs inside a correlation scope and instruments it
/// with the correlation span.
///
/// Inside an existing scope the flow's context is reused; otherwise a fresh
/// scope is opened for the duration of the dispatch.
#[derive(Debug, Clone, Default)]
pub struct CorrelationBehavior;

impl CorrelationBehavior {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl<R: Request> PipelineBehavior<R> for CorrelationBehavior {
    async fn handle(
        &self,
        request: R,
        next: Next<'_, R>,
        cancel: &CancellationToken,
    ) -> Result<R::Response> {
        if CorrelationContext::in_scope() {
            let span = CorrelationContext::current().span();
            return next.run(request, cancel).instrument(span).await;
        }

        CorrelationContext::fresh_scope(async move {
            let span = CorrelationContext::current().span();
            next.run(request, cancel).instrument(span).await
        })
        .await
    }
}

/// Logs the request name, duration and outcome of every dispatch.
#[derive(Debug, Clone, Default)]
pub struct LoggingBehavior;

impl LoggingBehavior {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl<R: Request> PipelineBehavior<R> for LoggingBehavior {
    async fn handle(
        &self,
        request: R,
        next: Next<'_, R>,
        cancel: &CancellationToken,
    ) -> Result<R::Response> {
        let name = request.name();
        let start = Instant::now();

        tracing::debug!(request = name, "Request received");

        let result = next.run(request, cancel).await;

        let elapsed = start.elapsed();
        match &result {
            Ok(_) => {
                tracing::info!(
                    request = name,
                    duration.ms = elapsed.as_millis() as u64,
                    "Request succeeded"
                );
            }
            Err(e) => {
                tracing::error!(
                    request = name,
                    error = %e,
                    duration.ms = elapsed.as_millis() as u64,
                    "Request failed"
                );
            }
        }

        result
    }
}
