//! Flow-scoped correlation context.
//!
//! Every logical flow (one inbound message, one dispatched request) owns at most
//! one [`CorrelationContext`]. The context lives in a tokio task-local slot, so it
//! follows the flow across `.await` points without being passed explicitly, and it
//! is never visible to independently spawned tasks. Transport adapters open a new
//! scope (or call [`CorrelationContext::reset`]) for every inbound message.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::types::CorrelationId;

/// Header carrying the correlation id.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";
/// Header carrying the causation id.
pub const CAUSATION_ID_HEADER: &str = "x-causation-id";
/// Header carrying the tenant id.
pub const TENANT_ID_HEADER: &str = "x-tenant-id";

tokio::task_local! {
    static CURRENT: RefCell<Option<CorrelationContext>>;
}

/// Correlation data attached to one logical flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationContext {
    correlation_id: CorrelationId,
    causation_id: Option<String>,
    tenant_id: Option<String>,
    metadata: HashMap<String, serde_json::Value>,
}

impl CorrelationContext {
    /// Creates a blank context with a freshly generated correlation id.
    pub fn new() -> Self {
        Self::with_correlation_id(CorrelationId::generate())
    }

    /// Creates a blank context for an existing correlation id.
    pub fn with_correlation_id(correlation_id: impl Into<CorrelationId>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            causation_id: None,
            tenant_id: None,
            metadata: HashMap::new(),
        }
    }

    /// Sets the causation id.
    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    /// Sets the tenant id.
    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn causation_id(&self) -> Option<&str> {
        self.causation_id.as_deref()
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn metadata(&self) -> &HashMap<String, serde_json::Value> {
        &self.metadata
    }

    /// Returns the context for a message produced while handling `message_id`.
    ///
    /// Correlation id, tenant and metadata carry over; the causation id becomes
    /// the id of the message being handled.
    pub fn caused_by(&self, message_id: impl Into<String>) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            causation_id: Some(message_id.into()),
            tenant_id: self.tenant_id.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Builds a context from message headers.
    ///
    /// A missing correlation id header yields a freshly generated id.
    pub fn from_headers(headers: &HashMap<String, String>) -> Self {
        let mut context = match headers.get(CORRELATION_ID_HEADER) {
            Some(id) if !id.is_empty() => Self::with_correlation_id(id.as_str()),
            _ => Self::new(),
        };
        if let Some(causation) = headers.get(CAUSATION_ID_HEADER).filter(|v| !v.is_empty()) {
            context.causation_id = Some(causation.clone());
        }
        if let Some(tenant) = headers.get(TENANT_ID_HEADER).filter(|v| !v.is_empty()) {
            context.tenant_id = Some(tenant.clone());
        }
        context
    }

    /// Renders the context as message headers.
    pub fn to_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert(
            CORRELATION_ID_HEADER.to_string(),
            self.correlation_id.to_string(),
        );
        if let Some(causation) = &self.causation_id {
            headers.insert(CAUSATION_ID_HEADER.to_string(), causation.clone());
        }
        if let Some(tenant) = &self.tenant_id {
            headers.insert(TENANT_ID_HEADER.to_string(), tenant.clone());
        }
        headers
    }

    /// Returns a tracing span carrying the correlation fields.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "correlation",
            correlation_id = %self.correlation_id,
            causation_id = self.causation_id.as_deref().unwrap_or(""),
            tenant_id = self.tenant_id.as_deref().unwrap_or(""),
        )
    }

    /// Returns the context of the calling flow.
    ///
    /// Inside a scope the context is created lazily on first access and then
    /// stays stable for the rest of the flow. Outside any scope a fresh context
    /// is returned and not stored.
    pub fn current() -> Self {
        CURRENT
            .try_with(|slot| {
                slot.borrow_mut()
                    .get_or_insert_with(CorrelationContext::new)
                    .clone()
            })
            .unwrap_or_else(|_| CorrelationContext::new())
    }

    /// Returns the context of the calling flow without creating one.
    pub fn try_current() -> Option<Self> {
        CURRENT
            .try_with(|slot| slot.borrow().clone())
            .ok()
            .flatten()
    }

    /// Replaces the flow's context with a fresh blank one and returns it.
    ///
    /// Outside any scope there is no flow to reset: the fresh context is
    /// returned but not stored, exactly as [`current`](Self::current) does.
    /// Check [`in_scope`](Self::in_scope) first when that matters.
    pub fn reset() -> Self {
        let fresh = CorrelationContext::new();
        if CURRENT
            .try_with(|slot| *slot.borrow_mut() = Some(fresh.clone()))
            .is_err()
        {
            tracing::trace!("correlation reset outside a scope; context not stored");
        }
        fresh
    }

    /// Returns true when the caller runs inside a correlation scope.
    pub fn in_scope() -> bool {
        CURRENT.try_with(|_| ()).is_ok()
    }

    /// Runs `future` as a flow owning `context`.
    pub async fn scope<F>(context: CorrelationContext, future: F) -> F::Output
    where
        F: Future,
    {
        CURRENT.scope(RefCell::new(Some(context)), future).await
    }

    /// Runs `future` as a flow whose context is created lazily on first access.
    pub async fn fresh_scope<F>(future: F) -> F::Output
    where
        F: Future,
    {
        CURRENT.scope(RefCell::new(None), future).await
    }
}

impl Default for CorrelationContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_current_is_stable_within_a_scope() {
        CorrelationContext::fresh_scope(async {
            let first = CorrelationContext::current();
            tokio::task::yield_now().await;
            let second = CorrelationContext::current();
            assert_eq!(first.correlation_id(), second.correlation_id());
        })
        .await;
    }

    #[tokio::test]
    async fn test_current_outside_scope_is_not_stored() {
        assert!(!CorrelationContext::in_scope());
        let a = CorrelationContext::current();
        let b = CorrelationContext::current();
        assert_ne!(a.correlation_id(), b.correlation_id());
        assert!(CorrelationContext::try_current().is_none());
    }

    #[tokio::test]
    async fn test_scope_exposes_given_context() {
        let ctx = CorrelationContext::with_correlation_id("corr-1").with_tenant_id("acme");
        CorrelationContext::scope(ctx.clone(), async move {
            assert_eq!(CorrelationContext::try_current(), Some(ctx));
        })
        .await;
    }

    #[tokio::test]
    async fn test_reset_replaces_the_flow_context() {
        let ctx = CorrelationContext::with_correlation_id("corr-1");
        CorrelationContext::scope(ctx, async {
            let fresh = CorrelationContext::reset();
            assert_ne!(fresh.correlation_id().as_str(), "corr-1");
            assert_eq!(CorrelationContext::current(), fresh);
        })
        .await;
    }

    #[tokio::test]
    async fn test_reset_outside_scope_is_not_stored() {
        let fresh = CorrelationContext::reset();
        assert!(CorrelationContext::try_current().is_none());
        assert_ne!(CorrelationContext::current(), fresh);
    }

    #[tokio::test]
    async fn test_spawned_tasks_do_not_share_context() {
        let outer = CorrelationContext::with_correlation_id("outer");
        CorrelationContext::scope(outer, async {
            let unscoped = tokio::spawn(async { CorrelationContext::try_current() })
                .await
                .unwrap();
            assert!(unscoped.is_none());

            let a = tokio::spawn(CorrelationContext::fresh_scope(async {
                CorrelationContext::current()
            }));
            let b = tokio::spawn(CorrelationContext::fresh_scope(async {
                CorrelationContext::current()
            }));
            let (a, b) = (a.await.unwrap(), b.await.unwrap());
            assert_ne!(a.correlation_id(), b.correlation_id());
            assert_eq!(CorrelationContext::current().correlation_id().as_str(), "outer");
        })
        .await;
    }

    #[test]
    fn test_headers_roundtrip() {
        let ctx = CorrelationContext::with_correlation_id("corr-1")
            .with_causation_id("msg-7")
            .with_tenant_id("acme");
        let restored = CorrelationContext::from_headers(&ctx.to_headers());
        assert_eq!(restored, ctx);
    }

    #[test]
    fn test_missing_correlation_header_generates_one() {
        let ctx = CorrelationContext::from_headers(&HashMap::new());
        assert!(!ctx.correlation_id().as_str().is_empty());
        assert!(ctx.causation_id().is_none());
    }

    #[test]
    fn test_caused_by_keeps_correlation_and_sets_causation() {
        let parent = CorrelationContext::with_correlation_id("corr-1").with_tenant_id("acme");
        let child = parent.caused_by("msg-9");
        assert_eq!(child.correlation_id(), parent.correlation_id());
        assert_eq!(child.causation_id(), Some("msg-9"));
        assert_eq!(child.tenant_id(), Some("acme"));
    }
}
