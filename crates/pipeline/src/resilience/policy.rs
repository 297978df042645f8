use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Semaphore;

use super::context::{ResilienceContext, ResilienceObserver};

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first one.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay before retry number `attempt + 1`: `base * 2^attempt`, capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a single trial execution is let
    /// through. A trial that never reports back is abandoned after the same
    /// period.
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default)]
struct CircuitState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_started_at: Option<Instant>,
}

#[derive(Debug)]
struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CircuitState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns false while the circuit is open. Once the open period has
    /// elapsed one trial execution is admitted (half-open); the rest are
    /// refused until the trial records its result.
    fn allows(&self) -> bool {
        let mut state = self.lock();
        let Some(opened_at) = state.opened_at else {
            return true;
        };
        if opened_at.elapsed() < self.config.open_duration {
            return false;
        }
        match state.trial_started_at {
            Some(started) if started.elapsed() < self.config.open_duration => false,
            _ => {
                state.trial_started_at = Some(Instant::now());
                true
            }
        }
    }

    fn record_success(&self) {
        let mut state = self.lock();
        state.consecutive_failures = 0;
        state.opened_at = None;
        state.trial_started_at = None;
    }

    fn record_failure(&self, policy: &str) {
        let mut state = self.lock();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.config.failure_threshold {
            if state.opened_at.is_none() {
                tracing::error!(
                    policy = policy,
                    failures = state.consecutive_failures,
                    "Circuit opened"
                );
            }
            state.opened_at = Some(Instant::now());
            state.trial_started_at = None;
        }
    }
}

/// Why a guarded execution did not produce a value.
#[derive(Debug, Error)]
pub enum GuardError<E> {
    /// The operation itself failed (after any retries).
    #[error("{0}")]
    Inner(E),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Circuit open")]
    CircuitOpen,

    #[error("Bulkhead rejected execution")]
    BulkheadRejected,
}

/// A named combination of retry, timeout, bulkhead and circuit breaker.
///
/// Every call to [`execute`](Self::execute) or [`execute_if`](Self::execute_if)
/// reports exactly one [`ResilienceContext`] to every observer.
pub struct ResiliencePolicy {
    name: String,
    retry: Option<RetryConfig>,
    timeout: Option<Duration>,
    bulkhead: Option<Arc<Semaphore>>,
    circuit: Option<CircuitBreaker>,
    observers: Vec<Arc<dyn ResilienceObserver>>,
}

impl ResiliencePolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retry: None,
            timeout: None,
            bulkhead: None,
            circuit: None,
            observers: Vec::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Timeout applied to each attempt.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Limits concurrent executions; excess executions are rejected, not queued.
    pub fn with_bulkhead(mut self, max_concurrency: usize) -> Self {
        self.bulkhead = Some(Arc::new(Semaphore::new(max_concurrency)));
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit = Some(CircuitBreaker::new(config));
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ResilienceObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `operation`, retrying every failure.
    pub async fn execute<T, E, F, Fut>(
        &self,
        operation: F,
    ) -> (Result<T, GuardError<E>>, ResilienceContext)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_if(operation, |_: &E| true).await
    }

    /// Runs `operation`, retrying failures for which `should_retry` returns true.
    /// Timeouts are always retried while attempts remain.
    pub async fn execute_if<T, E, F, Fut, P>(
        &self,
        mut operation: F,
        should_retry: P,
    ) -> (Result<T, GuardError<E>>, ResilienceContext)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let started = Instant::now();
        let mut context = ResilienceContext::new(self.name.as_str());

        let result = self
            .run(&mut operation, &should_retry, &mut context)
            .await;

        context.duration = started.elapsed();
        context.timestamp = Utc::now();
        self.report(&context);

        (result, context)
    }

    async fn run<T, E, F, Fut, P>(
        &self,
        operation: &mut F,
        should_retry: &P,
        context: &mut ResilienceContext,
    ) -> Result<T, GuardError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let _permit = match &self.bulkhead {
            Some(semaphore) => match semaphore.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    context.bulkhead_rejected = true;
                    return Err(GuardError::BulkheadRejected);
                }
            },
            None => None,
        };

        let max_retries = self.retry.as_ref().map_or(0, |r| r.max_retries);
        let mut attempt = 0u32;

        loop {
            if let Some(circuit) = &self.circuit
                && !circuit.allows()
            {
                context.circuit_open = true;
                return Err(GuardError::CircuitOpen);
            }

            let outcome = match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, operation()).await {
                    Ok(result) => result.map_err(GuardError::Inner),
                    Err(_) => {
                        context.timeout_occurred = true;
                        Err(GuardError::Timeout(limit))
                    }
                },
                None => operation().await.map_err(GuardError::Inner),
            };

            let error = match outcome {
                Ok(value) => {
                    if let Some(circuit) = &self.circuit {
                        circuit.record_success();
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if let Some(circuit) = &self.circuit {
                circuit.record_failure(&self.name);
            }

            let retryable = match &error {
                GuardError::Inner(inner) => should_retry(inner),
                GuardError::Timeout(_) => true,
                GuardError::CircuitOpen | GuardError::BulkheadRejected => false,
            };

            if !retryable || attempt >= max_retries {
                return Err(error);
            }

            let delay = self
                .retry
                .as_ref()
                .map_or(Duration::ZERO, |r| r.delay_for_attempt(attempt));
            tracing::debug!(
                policy = %self.name,
                attempt = attempt + 1,
                max_attempts = max_retries + 1,
                delay.ms = delay.as_millis() as u64,
                "Guarded operation failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
            context.retry_count = attempt;
        }
    }

    fn report(&self, context: &ResilienceContext) {
        for observer in &self.observers {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                observer.on_policy_executed(&self.name, context)
            }));
            if outcome.is_err() {
                tracing::error!(policy = %self.name, "Resilience observer panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Default)]
    struct Capture(Mutex<Vec<ResilienceContext>>);

    impl ResilienceObserver for Capture {
        fn on_policy_executed(&self, _policy_name: &str, context: &ResilienceContext) {
            self.0.lock().unwrap().push(context.clone());
        }
    }

    struct Panicking;

    impl ResilienceObserver for Panicking {
        fn on_policy_executed(&self, _policy_name: &str, _context: &ResilienceContext) {
            panic!("observer bug");
        }
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig::new(max_retries, Duration::from_millis(1))
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let retry = RetryConfig::new(5, Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500));
        assert_eq!(retry.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_success_reports_once() {
        let capture = Arc::new(Capture::default());
        let policy = ResiliencePolicy::new("inventory").with_observer(capture.clone());

        let before = Utc::now();
        let (result, context) = policy.execute(|| async { Ok::<_, String>(7) }).await;

        assert_eq!(result.unwrap(), 7);
        let reports = capture.0.lock().unwrap().clone();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0], context);
        assert!(reports[0].timestamp >= before);
        assert!(reports[0].is_healthy());
    }

    #[tokio::test]
    async fn test_retries_until_success_and_counts() {
        let capture = Arc::new(Capture::default());
        let policy = ResiliencePolicy::new("payments")
            .with_retry(fast_retry(3))
            .with_observer(capture.clone());
        let calls = AtomicU32::new(0);

        let (result, context) = policy
            .execute(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("flaky")
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(context.retry_count, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(capture.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_reported_and_propagated() {
        let capture = Arc::new(Capture::default());
        let policy = ResiliencePolicy::new("payments")
            .with_retry(fast_retry(2))
            .with_observer(capture.clone());

        let (result, context) = policy.execute(|| async { Err::<(), _>("declined") }).await;

        assert!(matches!(result, Err(GuardError::Inner("declined"))));
        assert_eq!(context.retry_count, 2);
        assert_eq!(capture.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_not_retried() {
        let policy = ResiliencePolicy::new("payments").with_retry(fast_retry(5));
        let calls = AtomicU32::new(0);

        let (result, context) = policy
            .execute_if(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("validation")
                },
                |e: &&str| *e != "validation",
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(context.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_flagged() {
        let policy = ResiliencePolicy::new("slow").with_timeout(Duration::from_millis(10));

        let (result, context) = policy
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, String>(())
            })
            .await;

        assert!(matches!(result, Err(GuardError::Timeout(_))));
        assert!(context.timeout_occurred);
        assert!(!context.is_healthy());
    }

    #[tokio::test]
    async fn test_bulkhead_rejects_when_full() {
        let policy = Arc::new(ResiliencePolicy::new("bulk").with_bulkhead(1));
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel::<()>();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let holder = {
            let policy = policy.clone();
            tokio::spawn(async move {
                let mut entered = Some(entered_tx);
                let mut release = Some(release_rx);
                policy
                    .execute(move || {
                        let entered = entered.take();
                        let release = release.take();
                        async move {
                            if let Some(tx) = entered {
                                let _ = tx.send(());
                            }
                            if let Some(rx) = release {
                                let _ = rx.await;
                            }
                            Ok::<_, String>(())
                        }
                    })
                    .await
                    .0
            })
        };

        entered_rx.await.unwrap();
        let (result, context) = policy.execute(|| async { Ok::<_, String>(()) }).await;
        assert!(matches!(result, Err(GuardError::BulkheadRejected)));
        assert!(context.bulkhead_rejected);

        release_tx.send(()).unwrap();
        assert!(holder.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_circuit_opens_after_threshold() {
        let policy = ResiliencePolicy::new("flaky").with_circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            open_duration: Duration::from_secs(60),
        });

        for _ in 0..2 {
            let (result, _) = policy.execute(|| async { Err::<(), _>("boom") }).await;
            assert!(matches!(result, Err(GuardError::Inner(_))));
        }

        let calls = AtomicU32::new(0);
        let (result, context) = policy
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await;

        assert!(matches!(result, Err(GuardError::CircuitOpen)));
        assert!(context.circuit_open);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_half_open_circuit_admits_a_single_trial() {
        let policy = Arc::new(ResiliencePolicy::new("flaky").with_circuit_breaker(
            CircuitBreakerConfig {
                failure_threshold: 1,
                open_duration: Duration::from_millis(50),
            },
        ));

        let (result, _) = policy.execute(|| async { Err::<(), _>("boom") }).await;
        assert!(matches!(result, Err(GuardError::Inner(_))));
        tokio::time::sleep(Duration::from_millis(60)).await;

        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel::<()>();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = tokio::spawn({
            let policy = policy.clone();
            async move {
                let mut signals = Some((entered_tx, release_rx));
                policy
                    .execute(|| {
                        let signal = signals.take();
                        async move {
                            if let Some((entered, release)) = signal {
                                entered.send(()).unwrap();
                                release.await.unwrap();
                            }
                            Ok::<_, &str>(())
                        }
                    })
                    .await
                    .0
            }
        });
        entered_rx.await.unwrap();

        let (result, context) = policy.execute(|| async { Ok::<_, &str>(()) }).await;
        assert!(matches!(result, Err(GuardError::CircuitOpen)));
        assert!(context.circuit_open);

        release_tx.send(()).unwrap();
        assert!(trial.await.unwrap().is_ok());

        let (result, _) = policy.execute(|| async { Ok::<_, &str>(()) }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_panicking_observer_does_not_affect_result() {
        let capture = Arc::new(Capture::default());
        let policy = ResiliencePolicy::new("observed")
            .with_observer(Arc::new(Panicking))
            .with_observer(capture.clone());

        let (result, _) = policy.execute(|| async { Ok::<_, String>(1) }).await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(capture.0.lock().unwrap().len(), 1);
    }
}
