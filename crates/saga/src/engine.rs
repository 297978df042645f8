//! The execution and compensation algorithm, typed per saga.
//!
//! The orchestrator stores every registered saga behind [`SagaDriver`] so
//! sagas with different state types share one routing table.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use common::{CorrelationContext, SagaId};
use pipeline::{GuardError, NotificationPublisher, PipelineError, ResiliencePolicy};
use state_store::{SagaStateStore, SagaStateStoreExt, SaveOptions, Version};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SagaError};
use crate::instance::{SagaFailure, SagaInstance};
use crate::lifecycle::SagaLifecycle;
use crate::lock::SagaLocks;
use crate::orchestrator::{OrchestratorConfig, SagaOutcome};
use crate::saga::{Saga, SagaContext, StepError};
use crate::status::SagaStatus;
use crate::step::SagaStepId;

pub(crate) type Merge<S> = Arc<dyn Fn(&(dyn Any + Send + Sync), &mut S) + Send + Sync>;

/// Shared collaborators of every saga driven by one orchestrator.
pub(crate) struct Runtime {
    pub(crate) store: Arc<dyn SagaStateStore>,
    pub(crate) config: OrchestratorConfig,
    pub(crate) step_policy: Option<Arc<ResiliencePolicy>>,
    pub(crate) notifications: Option<Arc<NotificationPublisher<SagaLifecycle>>>,
    pub(crate) locks: SagaLocks,
}

impl Runtime {
    /// Publishes a lifecycle notification. Failures are logged only.
    async fn notify(&self, event: SagaLifecycle, cancel: &CancellationToken) {
        let Some(publisher) = &self.notifications else {
            return;
        };
        if let Err(error) = publisher.publish(&event, cancel).await {
            tracing::warn!(
                event = event.event_type(),
                saga_id = %event.saga_id(),
                error = %error,
                "saga lifecycle notification failed"
            );
        }
    }
}

#[async_trait]
pub(crate) trait SagaDriver: Send + Sync {
    fn saga_type(&self) -> &'static str;

    fn steps(&self) -> &[SagaStepId];

    /// Applies a forward event for `step`.
    async fn apply_forward(
        &self,
        runtime: &Runtime,
        saga_id: SagaId,
        step: &SagaStepId,
        event_type: TypeId,
        event: &(dyn Any + Send + Sync),
        correlation: CorrelationContext,
        cancel: &CancellationToken,
    ) -> Result<SagaOutcome>;

    /// Applies a compensation-direction event.
    async fn apply_compensation(
        &self,
        runtime: &Runtime,
        saga_id: SagaId,
        event_type: &'static str,
        correlation: CorrelationContext,
        cancel: &CancellationToken,
    ) -> Result<SagaOutcome>;

    /// Creates (or resumes) an instance and drives every remaining step.
    async fn run_remaining(
        &self,
        runtime: &Runtime,
        saga_id: SagaId,
        initial_state: serde_json::Value,
        correlation: CorrelationContext,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Execute,
    Compensate,
}

impl Action {
    fn as_str(&self) -> &'static str {
        match self {
            Action::Execute => "execute",
            Action::Compensate => "compensate",
        }
    }
}

pub(crate) struct SagaEngine<S: Saga> {
    saga: S,
    saga_type: &'static str,
    steps: Vec<SagaStepId>,
    merges: HashMap<TypeId, Merge<S::State>>,
}

impl<S: Saga> SagaEngine<S> {
    pub(crate) fn new(saga: S, merges: HashMap<TypeId, Merge<S::State>>) -> Self {
        let saga_type = saga.saga_type();
        let steps = saga.steps();
        Self {
            saga,
            saga_type,
            steps,
            merges,
        }
    }

    /// Loads this saga's instance. A record written by another saga type
    /// under the same id is an error, never adopted.
    async fn load(
        &self,
        runtime: &Runtime,
        saga_id: &SagaId,
    ) -> Result<Option<(SagaInstance<S::State>, Version)>> {
        let Some(record) = runtime.store.load(saga_id).await? else {
            return Ok(None);
        };
        if record.saga_type != self.saga_type {
            tracing::warn!(
                %saga_id,
                expected = self.saga_type,
                found = %record.saga_type,
                "saga id already used by another saga type"
            );
            return Err(SagaError::SagaTypeMismatch {
                saga_id: saga_id.clone(),
                expected: self.saga_type.to_string(),
                found: record.saga_type,
            });
        }
        let version = record.version;
        Ok(Some((record.into_state()?, version)))
    }

    /// Persists a fresh `Running` instance before any step runs.
    ///
    /// A conflict means another flow created the instance first; its record
    /// is reloaded and returned instead.
    async fn create(
        &self,
        runtime: &Runtime,
        saga_id: &SagaId,
        state: &S::State,
    ) -> Result<(SagaInstance<S::State>, Version)> {
        let mut conflicts = 0;
        loop {
            let instance = SagaInstance::new(saga_id.clone(), self.saga_type, state.clone());
            let saved = runtime
                .store
                .save_state(saga_id, self.saga_type, &instance, SaveOptions::expect_new())
                .await;

            match saved {
                Ok(version) => {
                    tracing::debug!(%saga_id, saga_type = self.saga_type, "saga instance created");
                    return Ok((instance, version));
                }
                Err(e) if e.is_conflict() => {
                    metrics::counter!(
                        "saga_concurrency_conflicts_total",
                        "saga_type" => self.saga_type
                    )
                    .increment(1);
                    if let Some(found) = self.load(runtime, saga_id).await? {
                        return Ok(found);
                    }
                    conflicts += 1;
                    if conflicts > runtime.config.max_conflict_retries {
                        return Err(SagaError::Concurrency {
                            saga_id: saga_id.clone(),
                        });
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Saves the instance against the version it was loaded at.
    async fn persist(
        &self,
        runtime: &Runtime,
        instance: &mut SagaInstance<S::State>,
        version: &mut Version,
    ) -> Result<()> {
        instance.touch();
        let saved = runtime
            .store
            .save_state(
                instance.saga_id(),
                self.saga_type,
                &*instance,
                SaveOptions::expect_version(*version),
            )
            .await;

        match saved {
            Ok(new_version) => {
                *version = new_version;
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                metrics::counter!(
                    "saga_concurrency_conflicts_total",
                    "saga_type" => self.saga_type
                )
                .increment(1);
                tracing::warn!(
                    saga_id = %instance.saga_id(),
                    error = %e,
                    "saga instance modified concurrently"
                );
                Err(SagaError::Concurrency {
                    saga_id: instance.saga_id().clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn expect_next(&self, instance: &SagaInstance<S::State>, step: &SagaStepId) -> Result<()> {
        match self.steps.get(instance.executed_steps().len()) {
            Some(expected) if expected == step => Ok(()),
            Some(expected) => Err(SagaError::OutOfOrder {
                saga_id: instance.saga_id().clone(),
                expected: expected.clone(),
                actual: step.clone(),
            }),
            None => Err(SagaError::AlreadyStarted {
                saga_id: instance.saga_id().clone(),
                status: instance.status(),
            }),
        }
    }

    /// Runs one action of the saga under the step policy, on a copy of the
    /// state. Returns the mutated state on success.
    async fn invoke(
        &self,
        runtime: &Runtime,
        context: SagaContext<S::State>,
        action: Action,
        cancel: &CancellationToken,
    ) -> std::result::Result<S::State, StepError> {
        let started = Instant::now();
        let attempt = || {
            let mut context = context.clone();
            async move {
                match action {
                    Action::Execute => self.saga.execute(&mut context, cancel).await?,
                    Action::Compensate => self.saga.compensate(&mut context, cancel).await?,
                }
                Ok::<_, StepError>(context.into_state())
            }
        };

        let result = match &runtime.step_policy {
            None => attempt().await,
            Some(policy) => {
                let (result, _) = policy
                    .execute_if(attempt, |error: &StepError| {
                        !cancel.is_cancelled() && error.is_retryable()
                    })
                    .await;
                result.map_err(|error| match error {
                    GuardError::Inner(inner) => inner,
                    GuardError::Timeout(limit) => StepError::failed(PipelineError::Timeout(limit)),
                    GuardError::CircuitOpen => {
                        StepError::failed(PipelineError::CircuitOpen(policy.name().to_string()))
                    }
                    GuardError::BulkheadRejected => StepError::failed(
                        PipelineError::BulkheadRejected(policy.name().to_string()),
                    ),
                })
            }
        };

        metrics::histogram!(
            "saga_step_duration_seconds",
            "saga_type" => self.saga_type,
            "action" => action.as_str()
        )
        .record(started.elapsed().as_secs_f64());
        result
    }

    /// Executes `step`, persisting the outcome before returning.
    ///
    /// On failure every executed step is compensated and the step failure is
    /// returned.
    async fn run_step(
        &self,
        runtime: &Runtime,
        instance: &mut SagaInstance<S::State>,
        version: &mut Version,
        step: &SagaStepId,
        correlation: &CorrelationContext,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(SagaError::Cancelled);
        }

        let saga_id = instance.saga_id().clone();
        tracing::info!(%saga_id, %step, "saga step started");

        let context = SagaContext::new(
            saga_id.clone(),
            step.clone(),
            instance.state().clone(),
            correlation.clone(),
        );

        match self.invoke(runtime, context, Action::Execute, cancel).await {
            Ok(state) => {
                instance.set_state(state);
                instance.record_executed(step.clone());
                let finished = instance.executed_steps().len() == self.steps.len();
                if finished {
                    instance.complete();
                }
                self.persist(runtime, instance, version).await?;

                metrics::counter!("saga_steps_executed_total", "saga_type" => self.saga_type)
                    .increment(1);
                tracing::info!(%saga_id, %step, "saga step completed");
                runtime
                    .notify(
                        SagaLifecycle::step_completed(&saga_id, self.saga_type, step),
                        cancel,
                    )
                    .await;

                if finished {
                    metrics::counter!("saga_completed_total", "saga_type" => self.saga_type)
                        .increment(1);
                    tracing::info!(
                        %saga_id,
                        saga_type = self.saga_type,
                        "saga completed successfully"
                    );
                    runtime
                        .notify(SagaLifecycle::saga_completed(&saga_id, self.saga_type), cancel)
                        .await;
                }
                Ok(())
            }
            Err(StepError::Cancelled) => {
                tracing::debug!(%saga_id, %step, "saga step cancelled before its side effect");
                Err(SagaError::Cancelled)
            }
            Err(error) => {
                let reason = error.reason();
                metrics::counter!("saga_step_failures_total", "saga_type" => self.saga_type)
                    .increment(1);
                tracing::warn!(%saga_id, %step, error = %error, "saga step failed");

                instance.begin_compensation(SagaFailure {
                    step: step.clone(),
                    reason: reason.clone(),
                    during_compensation: false,
                });
                self.persist(runtime, instance, version).await?;
                runtime
                    .notify(
                        SagaLifecycle::step_failed(&saga_id, self.saga_type, step, &reason),
                        cancel,
                    )
                    .await;
                runtime
                    .notify(
                        SagaLifecycle::compensation_started(&saga_id, self.saga_type, step),
                        cancel,
                    )
                    .await;

                self.compensate(runtime, instance, version, correlation, cancel)
                    .await?;

                Err(SagaError::StepFailed {
                    saga_id,
                    step: step.clone(),
                    reason,
                })
            }
        }
    }

    /// Compensates every executed step not compensated yet, most recent
    /// first, persisting after each one.
    ///
    /// The first failing compensation moves the instance to `Failed` and stops
    /// the walk.
    async fn compensate(
        &self,
        runtime: &Runtime,
        instance: &mut SagaInstance<S::State>,
        version: &mut Version,
        correlation: &CorrelationContext,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let saga_id = instance.saga_id().clone();

        for step in instance.pending_compensations() {
            if cancel.is_cancelled() {
                tracing::warn!(%saga_id, %step, "saga compensation cancelled");
                return Err(SagaError::Cancelled);
            }

            let context = SagaContext::new(
                saga_id.clone(),
                step.clone(),
                instance.state().clone(),
                correlation.clone(),
            );

            match self.invoke(runtime, context, Action::Compensate, cancel).await {
                Ok(state) => {
                    instance.set_state(state);
                    instance.record_compensated(step.clone());
                    self.persist(runtime, instance, version).await?;

                    metrics::counter!("saga_compensations_total", "saga_type" => self.saga_type)
                        .increment(1);
                    tracing::info!(%saga_id, %step, "saga compensation step completed");
                    runtime
                        .notify(
                            SagaLifecycle::compensation_step_completed(
                                &saga_id,
                                self.saga_type,
                                &step,
                            ),
                            cancel,
                        )
                        .await;
                }
                Err(StepError::Cancelled) => {
                    tracing::warn!(%saga_id, %step, "saga compensation cancelled");
                    return Err(SagaError::Cancelled);
                }
                Err(error) => {
                    let reason = error.reason();
                    instance.fail(SagaFailure {
                        step: step.clone(),
                        reason: reason.clone(),
                        during_compensation: true,
                    });
                    self.persist(runtime, instance, version).await?;

                    metrics::counter!("saga_failed_total", "saga_type" => self.saga_type)
                        .increment(1);
                    tracing::error!(
                        %saga_id,
                        saga_type = self.saga_type,
                        %step,
                        error = %error,
                        "saga compensation failed; operator intervention required"
                    );
                    runtime
                        .notify(
                            SagaLifecycle::compensation_step_failed(
                                &saga_id,
                                self.saga_type,
                                &step,
                                &reason,
                            ),
                            cancel,
                        )
                        .await;
                    runtime
                        .notify(
                            SagaLifecycle::saga_failed(
                                &saga_id,
                                self.saga_type,
                                format!("compensation of '{step}' failed: {reason}"),
                            ),
                            cancel,
                        )
                        .await;

                    return Err(SagaError::CompensationFailed {
                        saga_id,
                        step,
                        reason,
                    });
                }
            }
        }

        instance.finish_compensation();
        self.persist(runtime, instance, version).await?;

        metrics::counter!("saga_compensated_total", "saga_type" => self.saga_type).increment(1);
        tracing::warn!(
            %saga_id,
            saga_type = self.saga_type,
            compensated = instance.compensated_steps().len(),
            "saga compensated"
        );
        runtime
            .notify(SagaLifecycle::saga_compensated(&saga_id, self.saga_type), cancel)
            .await;
        Ok(())
    }
}

#[async_trait]
impl<S: Saga> SagaDriver for SagaEngine<S> {
    fn saga_type(&self) -> &'static str {
        self.saga_type
    }

    fn steps(&self) -> &[SagaStepId] {
        &self.steps
    }

    async fn apply_forward(
        &self,
        runtime: &Runtime,
        saga_id: SagaId,
        step: &SagaStepId,
        event_type: TypeId,
        event: &(dyn Any + Send + Sync),
        correlation: CorrelationContext,
        cancel: &CancellationToken,
    ) -> Result<SagaOutcome> {
        let _guard = runtime.locks.acquire(&saga_id).await;

        let (mut instance, mut version) = match self.load(runtime, &saga_id).await? {
            Some(found) => found,
            None => {
                if let Some(first) = self.steps.first().filter(|first| *first != step) {
                    return Err(SagaError::OutOfOrder {
                        saga_id,
                        expected: first.clone(),
                        actual: step.clone(),
                    });
                }
                if cancel.is_cancelled() {
                    return Err(SagaError::Cancelled);
                }
                self.create(runtime, &saga_id, &S::State::default()).await?
            }
        };

        if !instance.status().accepts_forward_events() {
            tracing::debug!(
                %saga_id,
                %step,
                status = %instance.status(),
                "forward event ignored"
            );
            return Ok(SagaOutcome::Ignored {
                saga_id,
                status: Some(instance.status()),
            });
        }

        if instance.has_executed(step) {
            tracing::debug!(%saga_id, %step, "step already applied");
            return Ok(SagaOutcome::AlreadyApplied {
                saga_id,
                step: step.clone(),
            });
        }

        self.expect_next(&instance, step)?;

        if let Some(merge) = self.merges.get(&event_type) {
            merge(event, instance.state_mut());
        }

        self.run_step(runtime, &mut instance, &mut version, step, &correlation, cancel)
            .await?;

        Ok(SagaOutcome::StepExecuted {
            saga_id,
            step: step.clone(),
            status: instance.status(),
        })
    }

    async fn apply_compensation(
        &self,
        runtime: &Runtime,
        saga_id: SagaId,
        event_type: &'static str,
        correlation: CorrelationContext,
        cancel: &CancellationToken,
    ) -> Result<SagaOutcome> {
        let _guard = runtime.locks.acquire(&saga_id).await;

        let Some((mut instance, mut version)) = self.load(runtime, &saga_id).await? else {
            tracing::debug!(%saga_id, event_type, "compensation event for unknown saga ignored");
            return Ok(SagaOutcome::Ignored {
                saga_id,
                status: None,
            });
        };

        match instance.status() {
            SagaStatus::Running => {
                if cancel.is_cancelled() {
                    return Err(SagaError::Cancelled);
                }
                let from_step = self
                    .steps
                    .get(instance.executed_steps().len())
                    .cloned()
                    .unwrap_or_else(|| SagaStepId::from(event_type));
                tracing::info!(%saga_id, event_type, "saga compensation requested");

                instance.begin_compensation(SagaFailure {
                    step: from_step.clone(),
                    reason: format!("compensation requested by {event_type}"),
                    during_compensation: false,
                });
                self.persist(runtime, &mut instance, &mut version).await?;
                runtime
                    .notify(
                        SagaLifecycle::compensation_started(&saga_id, self.saga_type, &from_step),
                        cancel,
                    )
                    .await;
            }
            SagaStatus::Compensating => {
                tracing::info!(%saga_id, event_type, "resuming saga compensation");
            }
            status => {
                tracing::debug!(%saga_id, event_type, %status, "compensation event ignored");
                return Ok(SagaOutcome::Ignored {
                    saga_id,
                    status: Some(status),
                });
            }
        }

        self.compensate(runtime, &mut instance, &mut version, &correlation, cancel)
            .await?;

        Ok(SagaOutcome::Compensated {
            saga_id,
            compensated: instance.compensated_steps().to_vec(),
        })
    }

    async fn run_remaining(
        &self,
        runtime: &Runtime,
        saga_id: SagaId,
        initial_state: serde_json::Value,
        correlation: CorrelationContext,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let initial_state: S::State = serde_json::from_value(initial_state)?;
        let _guard = runtime.locks.acquire(&saga_id).await;

        let (mut instance, mut version) = match self.load(runtime, &saga_id).await? {
            Some(found) => found,
            None => self.create(runtime, &saga_id, &initial_state).await?,
        };

        if !instance.status().accepts_forward_events() {
            return Err(SagaError::AlreadyStarted {
                saga_id,
                status: instance.status(),
            });
        }

        let executed = instance.executed_steps().len();
        let remaining: Vec<SagaStepId> = self.steps.iter().skip(executed).cloned().collect();
        for step in &remaining {
            self.run_step(runtime, &mut instance, &mut version, step, &correlation, cancel)
                .await?;
        }
        Ok(())
    }
}
