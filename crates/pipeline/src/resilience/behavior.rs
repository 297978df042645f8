use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::policy::{GuardError, ResiliencePolicy};
use crate::error::{PipelineError, Result};
use crate::request::{Next, PipelineBehavior, Request};

type RetryPredicate = Arc<dyn Fn(&PipelineError) -> bool + Send + Sync>;

/// Runs the rest of the pipeline under a [`ResiliencePolicy`].
///
/// Each retry re-runs every inner behavior with a clone of the request, so a
/// transaction behavior registered after this one starts a fresh transaction
/// per attempt.
pub struct ResilienceBehavior {
    policy: Arc<ResiliencePolicy>,
    should_retry: RetryPredicate,
}

impl ResilienceBehavior {
    /// Retries transient pipeline errors.
    pub fn new(policy: Arc<ResiliencePolicy>) -> Self {
        Self {
            policy,
            should_retry: Arc::new(PipelineError::is_transient),
        }
    }

    pub fn retry_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&PipelineError) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    fn convert(&self, error: GuardError<PipelineError>) -> PipelineError {
        match error {
            GuardError::Inner(inner) => inner,
            GuardError::Timeout(limit) => PipelineError::Timeout(limit),
            GuardError::CircuitOpen => PipelineError::CircuitOpen(self.policy.name().to_string()),
            GuardError::BulkheadRejected => {
                PipelineError::BulkheadRejected(self.policy.name().to_string())
            }
        }
    }
}

#[async_trait]
impl<R> PipelineBehavior<R> for ResilienceBehavior
where
    R: Request + Clone,
{
    async fn handle(
        &self,
        request: R,
        next: Next<'_, R>,
        cancel: &CancellationToken,
    ) -> Result<R::Response> {
        let should_retry = &self.should_retry;
        let (result, _context) = self
            .policy
            .execute_if(
                || {
                    let request = request.clone();
                    async move {
                        if cancel.is_cancelled() {
                            return Err(PipelineError::Cancelled);
                        }
                        next.run(request, cancel).await
                    }
                },
                |error: &PipelineError| !cancel.is_cancelled() && should_retry(error),
            )
            .await;

        result.map_err(|error| self.convert(error))
    }
}
