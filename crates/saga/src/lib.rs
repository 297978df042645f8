//! Saga orchestration for multi-step distributed transactions.
//!
//! A saga is a named, ordered sequence of steps, each paired with a
//! compensating action. Inbound events are routed to steps through an
//! explicit registration table; the orchestrator loads the instance from a
//! [`SagaStateStore`](state_store::SagaStateStore), runs the step, persists the
//! outcome and, when a step fails, compensates the executed steps in reverse
//! order.
//!
//! Instance lifecycle:
//! 1. `Running` while steps execute
//! 2. `Completed` once the last step is recorded
//! 3. `Compensating` → `Compensated` after a step failure
//! 4. `Failed` when a compensation itself fails

mod engine;
mod lock;

pub mod error;
pub mod event;
pub mod handler;
pub mod instance;
pub mod lifecycle;
pub mod orchestrator;
pub mod registration;
pub mod saga;
pub mod status;
pub mod step;

pub use error::{ConfigError, Result, SagaError};
pub use event::SagaEvent;
pub use handler::{HandleSagaEvent, SagaEventHandler};
pub use instance::{SagaFailure, SagaInstance};
pub use lifecycle::SagaLifecycle;
pub use orchestrator::{OrchestratorConfig, SagaOrchestrator, SagaOrchestratorBuilder, SagaOutcome};
pub use registration::SagaRegistration;
pub use saga::{Saga, SagaContext, StepError};
pub use status::SagaStatus;
pub use step::SagaStepId;
