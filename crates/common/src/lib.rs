//! Shared identifiers and the flow-scoped correlation context.

pub mod context;
pub mod types;

pub use context::{
    CAUSATION_ID_HEADER, CORRELATION_ID_HEADER, CorrelationContext, TENANT_ID_HEADER,
};
pub use types::{CorrelationId, SagaId};
