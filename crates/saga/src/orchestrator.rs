//! Saga orchestrator: routes inbound events to saga steps.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use common::{CorrelationContext, SagaId};
use pipeline::{NotificationPublisher, ResiliencePolicy};
use serde::Serialize;
use serde::de::DeserializeOwned;
use state_store::{SagaStateStore, SagaStateStoreExt};
use tokio_util::sync::CancellationToken;

use crate::engine::{Runtime, SagaDriver};
use crate::error::{ConfigError, Result, SagaError};
use crate::event::SagaEvent;
use crate::instance::SagaInstance;
use crate::lifecycle::SagaLifecycle;
use crate::lock::SagaLocks;
use crate::registration::{Direction, RouteSpec, SagaRegistration};
use crate::saga::Saga;
use crate::status::SagaStatus;
use crate::step::SagaStepId;

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How often creating a fresh instance is retried after a conflict.
    pub max_conflict_retries: u32,
}

impl OrchestratorConfig {
    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
        }
    }
}

/// What handling one inbound event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaOutcome {
    /// The step ran and its completion was persisted.
    StepExecuted {
        saga_id: SagaId,
        step: SagaStepId,
        status: SagaStatus,
    },

    /// The step was already recorded as executed; nothing ran.
    AlreadyApplied { saga_id: SagaId, step: SagaStepId },

    /// The instance does not accept the event. `None` when no instance exists.
    Ignored {
        saga_id: SagaId,
        status: Option<SagaStatus>,
    },

    /// Every executed step was compensated, in this order.
    Compensated {
        saga_id: SagaId,
        compensated: Vec<SagaStepId>,
    },
}

impl SagaOutcome {
    pub fn saga_id(&self) -> &SagaId {
        match self {
            SagaOutcome::StepExecuted { saga_id, .. }
            | SagaOutcome::AlreadyApplied { saga_id, .. }
            | SagaOutcome::Ignored { saga_id, .. }
            | SagaOutcome::Compensated { saga_id, .. } => saga_id,
        }
    }
}

struct Route {
    saga_type: &'static str,
    event_type: &'static str,
    direction: Direction,
}

/// Minimal view of a persisted instance, independent of its state type.
#[derive(serde::Deserialize)]
struct InstanceHeader {
    status: SagaStatus,
}

/// Coordinates every registered saga.
///
/// For each inbound event the orchestrator resolves the owning saga and step
/// from the registration table, loads the instance, executes or compensates,
/// and persists the result before returning. Flows touching the same instance
/// are serialized in-process; across processes every save is a versioned
/// compare-and-swap.
pub struct SagaOrchestrator {
    runtime: Runtime,
    sagas: HashMap<&'static str, Arc<dyn SagaDriver>>,
    routes: HashMap<TypeId, Route>,
}

impl SagaOrchestrator {
    pub fn builder(store: Arc<dyn SagaStateStore>) -> SagaOrchestratorBuilder {
        SagaOrchestratorBuilder {
            store,
            config: OrchestratorConfig::default(),
            step_policy: None,
            notifications: None,
            registrations: Vec::new(),
        }
    }

    /// Handles one inbound event.
    ///
    /// The saga instance id is the event's own [`SagaEvent::saga_id`] when
    /// present, otherwise `correlation_id`.
    #[tracing::instrument(
        skip(self, event, cancel),
        fields(event_type = E::EVENT_TYPE, saga_id = tracing::field::Empty)
    )]
    pub async fn handle_event<E: SagaEvent>(
        &self,
        event: &E,
        correlation_id: &str,
        causation_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<SagaOutcome> {
        metrics::counter!("saga_events_handled_total", "event_type" => E::EVENT_TYPE)
            .increment(1);

        let route = self
            .routes
            .get(&TypeId::of::<E>())
            .ok_or(SagaError::Unrouted {
                event_type: E::EVENT_TYPE,
            })?;
        let driver = self.driver(route.saga_type)?;

        let saga_id = event
            .saga_id()
            .unwrap_or_else(|| SagaId::from(correlation_id));
        tracing::Span::current().record("saga_id", tracing::field::display(&saga_id));

        let correlation = flow_context(correlation_id, causation_id);

        match &route.direction {
            Direction::Forward(step) => {
                let event: &(dyn Any + Send + Sync) = event;
                driver
                    .apply_forward(
                        &self.runtime,
                        saga_id,
                        step,
                        TypeId::of::<E>(),
                        event,
                        correlation,
                        cancel,
                    )
                    .await
            }
            Direction::Compensate => {
                driver
                    .apply_compensation(
                        &self.runtime,
                        saga_id,
                        route.event_type,
                        correlation,
                        cancel,
                    )
                    .await
            }
        }
    }

    /// Starts (or resumes) an instance and drives every remaining step
    /// in-process.
    ///
    /// `initial_state` is used only when the instance does not exist yet.
    /// Returns the final instance; a failed step is reported as
    /// [`SagaError::StepFailed`] after compensation.
    #[tracing::instrument(skip(self, initial_state, cancel))]
    pub async fn run_to_completion<S>(
        &self,
        saga_type: &str,
        saga_id: SagaId,
        initial_state: S,
        cancel: &CancellationToken,
    ) -> Result<SagaInstance<S>>
    where
        S: Serialize + DeserializeOwned + Send,
    {
        metrics::counter!("saga_executions_total").increment(1);
        let driver = self.driver(saga_type)?;
        let correlation = flow_context(saga_id.as_str(), None);

        driver
            .run_remaining(
                &self.runtime,
                saga_id.clone(),
                serde_json::to_value(&initial_state)?,
                correlation,
                cancel,
            )
            .await?;

        self.find_instance(saga_type, &saga_id)
            .await?
            .ok_or(SagaError::NotFound(saga_id))
    }

    /// Loads an instance with its typed state, whatever saga type wrote it.
    ///
    /// Check [`SagaInstance::saga_type`] or use [`find_instance`] when the
    /// id may be shared between saga types.
    ///
    /// [`find_instance`]: SagaOrchestrator::find_instance
    pub async fn get_instance<S>(&self, saga_id: &SagaId) -> Result<Option<SagaInstance<S>>>
    where
        S: DeserializeOwned + Send,
    {
        let loaded = self
            .runtime
            .store
            .load_state::<SagaInstance<S>>(saga_id)
            .await?;
        Ok(loaded.map(|(instance, _)| instance))
    }

    /// Loads the instance of `saga_type` stored under `saga_id`.
    ///
    /// Fails with [`SagaError::SagaTypeMismatch`] when the id holds another
    /// saga's instance.
    pub async fn find_instance<S>(
        &self,
        saga_type: &str,
        saga_id: &SagaId,
    ) -> Result<Option<SagaInstance<S>>>
    where
        S: DeserializeOwned + Send,
    {
        let Some(record) = self.runtime.store.load(saga_id).await? else {
            return Ok(None);
        };
        if record.saga_type != saga_type {
            return Err(SagaError::SagaTypeMismatch {
                saga_id: saga_id.clone(),
                expected: saga_type.to_string(),
                found: record.saga_type,
            });
        }
        Ok(Some(record.into_state()?))
    }

    /// Deletes a terminal instance. Deleting an absent instance is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn purge(&self, saga_id: &SagaId) -> Result<()> {
        let _guard = self.runtime.locks.acquire(saga_id).await;

        let Some((header, _)) = self
            .runtime
            .store
            .load_state::<InstanceHeader>(saga_id)
            .await?
        else {
            return Ok(());
        };

        if !header.status.is_terminal() {
            return Err(SagaError::NotTerminal {
                saga_id: saga_id.clone(),
                status: header.status,
            });
        }

        self.runtime.store.delete(saga_id).await?;
        tracing::info!(%saga_id, status = %header.status, "saga instance purged");
        Ok(())
    }

    /// Fails unless `E` is routed. Hosts call this at start-up for every
    /// event type they consume.
    pub fn require_route<E: SagaEvent>(&self) -> std::result::Result<(), ConfigError> {
        if self.routes.contains_key(&TypeId::of::<E>()) {
            Ok(())
        } else {
            Err(ConfigError::MissingRoute {
                event_type: E::EVENT_TYPE,
            })
        }
    }

    /// Registered saga types.
    pub fn saga_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.sagas.keys().copied().collect();
        types.sort_unstable();
        types
    }

    fn driver(&self, saga_type: &str) -> Result<&Arc<dyn SagaDriver>> {
        self.sagas
            .get(saga_type)
            .ok_or_else(|| SagaError::UnknownSagaType(saga_type.to_string()))
    }
}

/// Builds the correlation context for one handled event.
///
/// Reuses the flow's context when it carries the same correlation id, so
/// tenant and metadata survive.
fn flow_context(correlation_id: &str, causation_id: Option<&str>) -> CorrelationContext {
    let context = CorrelationContext::try_current()
        .filter(|current| current.correlation_id().as_str() == correlation_id)
        .unwrap_or_else(|| CorrelationContext::with_correlation_id(correlation_id));
    match causation_id {
        Some(causation_id) => context.with_causation_id(causation_id),
        None => context,
    }
}

/// Builder for [`SagaOrchestrator`]. Wiring errors surface from [`build`].
///
/// [`build`]: SagaOrchestratorBuilder::build
pub struct SagaOrchestratorBuilder {
    store: Arc<dyn SagaStateStore>,
    config: OrchestratorConfig,
    step_policy: Option<Arc<ResiliencePolicy>>,
    notifications: Option<Arc<NotificationPublisher<SagaLifecycle>>>,
    registrations: Vec<(Arc<dyn SagaDriver>, Vec<RouteSpec>)>,
}

impl SagaOrchestratorBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn register<S: Saga>(mut self, registration: SagaRegistration<S>) -> Self {
        self.registrations.push(registration.into_parts());
        self
    }

    /// Guards every execute and compensate call (timeouts, retries, circuit
    /// breaking). A guarded failure is an ordinary step failure.
    pub fn step_policy(mut self, policy: Arc<ResiliencePolicy>) -> Self {
        self.step_policy = Some(policy);
        self
    }

    pub fn notifications(mut self, publisher: Arc<NotificationPublisher<SagaLifecycle>>) -> Self {
        self.notifications = Some(publisher);
        self
    }

    pub fn build(self) -> std::result::Result<SagaOrchestrator, ConfigError> {
        if !self.store.capabilities().durable_point_lookups {
            return Err(ConfigError::UnsupportedStore);
        }

        let mut sagas: HashMap<&'static str, Arc<dyn SagaDriver>> = HashMap::new();
        let mut routes: HashMap<TypeId, Route> = HashMap::new();
        let mut event_types: HashSet<&'static str> = HashSet::new();

        for (driver, specs) in self.registrations {
            let saga_type = driver.saga_type();
            validate_steps(saga_type, driver.steps())?;

            for spec in specs {
                if let Direction::Forward(step) = &spec.direction {
                    if !driver.steps().contains(step) {
                        return Err(ConfigError::UnknownStep {
                            saga_type: saga_type.to_string(),
                            event_type: spec.event_type,
                            step: step.clone(),
                        });
                    }
                }
                if routes.contains_key(&spec.type_id) || !event_types.insert(spec.event_type) {
                    return Err(ConfigError::AmbiguousRoute {
                        event_type: spec.event_type,
                    });
                }
                routes.insert(
                    spec.type_id,
                    Route {
                        saga_type,
                        event_type: spec.event_type,
                        direction: spec.direction,
                    },
                );
            }

            if sagas.insert(saga_type, driver).is_some() {
                return Err(ConfigError::DuplicateSagaType(saga_type.to_string()));
            }
        }

        tracing::info!(
            sagas = sagas.len(),
            routes = routes.len(),
            "saga orchestrator configured"
        );

        Ok(SagaOrchestrator {
            runtime: Runtime {
                store: self.store,
                config: self.config,
                step_policy: self.step_policy,
                notifications: self.notifications,
                locks: SagaLocks::default(),
            },
            sagas,
            routes,
        })
    }
}

fn validate_steps(saga_type: &str, steps: &[SagaStepId]) -> std::result::Result<(), ConfigError> {
    if steps.is_empty() {
        return Err(ConfigError::EmptySaga {
            saga_type: saga_type.to_string(),
        });
    }
    let mut seen = HashSet::new();
    for step in steps {
        if !seen.insert(step) {
            return Err(ConfigError::DuplicateStep {
                saga_type: saga_type.to_string(),
                step: step.clone(),
            });
        }
    }
    Ok(())
}
