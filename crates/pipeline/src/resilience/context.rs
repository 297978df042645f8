use std::time::Duration;

use chrono::{DateTime, Utc};

/// Outcome of one guarded execution, reported to observers and then discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct ResilienceContext {
    pub policy_name: String,
    pub retry_count: u32,
    pub circuit_open: bool,
    pub timeout_occurred: bool,
    pub bulkhead_rejected: bool,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

impl ResilienceContext {
    pub fn new(policy_name: impl Into<String>) -> Self {
        Self {
            policy_name: policy_name.into(),
            retry_count: 0,
            circuit_open: false,
            timeout_occurred: false,
            bulkhead_rejected: false,
            duration: Duration::ZERO,
            timestamp: Utc::now(),
        }
    }

    /// True when no circuit-open, timeout or bulkhead rejection was observed.
    ///
    /// Reporting only: it never changes the result of the execution.
    pub fn is_healthy(&self) -> bool {
        !self.circuit_open && !self.timeout_occurred && !self.bulkhead_rejected
    }
}

/// Receives one report per guarded execution, success or failure.
///
/// Observers are fire-and-forget: a panic inside an observer is caught and
/// logged by the policy and never affects the guarded result.
pub trait ResilienceObserver: Send + Sync {
    fn on_policy_executed(&self, policy_name: &str, context: &ResilienceContext);
}

/// Logs every execution; unhealthy ones at warn level.
#[derive(Debug, Clone, Default)]
pub struct LoggingResilienceObserver;

impl ResilienceObserver for LoggingResilienceObserver {
    fn on_policy_executed(&self, policy_name: &str, context: &ResilienceContext) {
        if context.is_healthy() {
            tracing::debug!(
                policy = policy_name,
                retries = context.retry_count,
                duration.ms = context.duration.as_millis() as u64,
                "Policy executed"
            );
        } else {
            tracing::warn!(
                policy = policy_name,
                retries = context.retry_count,
                circuit_open = context.circuit_open,
                timeout = context.timeout_occurred,
                bulkhead_rejected = context.bulkhead_rejected,
                duration.ms = context.duration.as_millis() as u64,
                "Policy executed unhealthy"
            );
        }
    }
}

/// Records execution counts and durations per policy.
#[derive(Debug, Clone, Default)]
pub struct MetricsResilienceObserver;

impl ResilienceObserver for MetricsResilienceObserver {
    fn on_policy_executed(&self, policy_name: &str, context: &ResilienceContext) {
        let policy = policy_name.to_string();
        metrics::counter!("resilience_executions_total", "policy" => policy.clone()).increment(1);
        if !context.is_healthy() {
            metrics::counter!("resilience_unhealthy_total", "policy" => policy.clone())
                .increment(1);
        }
        metrics::histogram!("resilience_duration_seconds", "policy" => policy)
            .record(context.duration.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_healthy_is_and_of_flags() {
        let mut ctx = ResilienceContext::new("payments");
        assert!(ctx.is_healthy());

        ctx.retry_count = 3;
        assert!(ctx.is_healthy());

        ctx.timeout_occurred = true;
        assert!(!ctx.is_healthy());

        let mut ctx = ResilienceContext::new("payments");
        ctx.bulkhead_rejected = true;
        assert!(!ctx.is_healthy());

        let mut ctx = ResilienceContext::new("payments");
        ctx.circuit_open = true;
        assert!(!ctx.is_healthy());
    }
}
