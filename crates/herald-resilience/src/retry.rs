//! Retry execution engine.
//!
//! [`RetryExecutor`] calls an operation until it succeeds, fails with an
//! error its classifier says is not retryable, or runs out of attempts.
//! Between attempts it sleeps for `max(backoff(attempt), suggested_delay)`.
//! The sleep is cancellable through a `watch` channel, and a circuit breaker
//! can veto attempts against a known-bad resource.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, warn};

use crate::{BackoffConfig, CircuitBreaker, Classify, FailureClassification, RateLimiter};

/// Retry policy for one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, counting the first one.
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
    /// Upper bound on a single attempt. Timeouts are transient failures.
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffConfig::default(),
            attempt_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: BackoffConfig) -> Self {
        Self {
            max_attempts,
            backoff,
            ..Self::default()
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }
}

/// What went wrong on the last attempt.
#[derive(Debug)]
pub enum AttemptError<E> {
    /// The operation itself failed.
    Operation(E),
    /// The operation did not finish within the attempt timeout.
    Timeout(Duration),
    /// The circuit breaker refused the call; the operation was not invoked.
    CircuitOpen {
        resource: String,
        retry_after: Duration,
    },
    /// Cancellation was requested before an attempt could start.
    Cancelled,
    /// The attempt budget was already spent before this run started.
    Exhausted,
}

impl<E: fmt::Display> fmt::Display for AttemptError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Operation(e) => write!(f, "{}", e),
            AttemptError::Timeout(t) => write!(f, "attempt timed out after {}ms", t.as_millis()),
            AttemptError::CircuitOpen {
                resource,
                retry_after,
            } => write!(
                f,
                "circuit open for {} (retry after {}ms)",
                resource,
                retry_after.as_millis()
            ),
            AttemptError::Cancelled => write!(f, "cancelled"),
            AttemptError::Exhausted => write!(f, "no attempts left"),
        }
    }
}

/// Why the executor stopped trying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    NotRetryable,
    AttemptsExhausted,
    CircuitOpen,
    Cancelled,
}

/// Terminal failure with the classification of the last error preserved.
#[derive(Debug)]
pub struct RetryFailure<E> {
    pub error: AttemptError<E>,
    pub classification: FailureClassification,
    pub reason: GiveUpReason,
}

/// Outcome of [`RetryExecutor::execute`].
#[derive(Debug)]
pub struct RetryReport<T, E> {
    pub outcome: Result<T, RetryFailure<E>>,
    /// Attempt counter after this run, including attempts made before
    /// [`RetryExecutor::starting_at`].
    pub attempts: u32,
    pub total_elapsed: Duration,
}

impl<T, E> RetryReport<T, E> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn into_result(self) -> Result<T, RetryFailure<E>> {
        self.outcome
    }
}

/// A failed attempt that is about to be retried.
pub struct RetryEvent<'a, E> {
    pub attempt: u32,
    pub error: &'a AttemptError<E>,
    pub classification: &'a FailureClassification,
    pub delay: Duration,
}

/// Callbacks for retry telemetry.
#[async_trait]
pub trait RetryObserver<E: Send + Sync>: Send + Sync {
    /// Called right before attempt number `attempt` is invoked.
    async fn on_attempt(&self, attempt: u32) {
        let _ = attempt;
    }

    /// Called after a retryable failure, before sleeping.
    async fn on_retry(&self, event: RetryEvent<'_, E>) {
        let _ = event;
    }
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpObserver;

impl<E: Send + Sync> RetryObserver<E> for NoOpObserver {}

/// Observer that logs retries through `tracing`.
#[derive(Debug, Clone)]
pub struct TracingObserver {
    operation: String,
}

impl TracingObserver {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
        }
    }
}

#[async_trait]
impl<E: fmt::Display + Send + Sync> RetryObserver<E> for TracingObserver {
    async fn on_attempt(&self, attempt: u32) {
        debug!(operation = %self.operation, attempt, "starting attempt");
    }

    async fn on_retry(&self, event: RetryEvent<'_, E>) {
        warn!(
            operation = %self.operation,
            attempt = event.attempt,
            category = %event.classification.category,
            delay_ms = event.delay.as_millis() as u64,
            error = %event.error,
            "attempt failed, retrying"
        );
    }
}

/// Runs operations under a [`RetryPolicy`].
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    breaker: Option<(Arc<CircuitBreaker>, String)>,
    limiter: Option<(Arc<RateLimiter>, String)>,
    starting_attempt: u32,
    cancel: Option<watch::Receiver<bool>>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            breaker: None,
            limiter: None,
            starting_attempt: 0,
            cancel: None,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Guard every attempt with `breaker` under `resource`.
    pub fn with_circuit_breaker(
        mut self,
        breaker: Arc<CircuitBreaker>,
        resource: impl Into<String>,
    ) -> Self {
        self.breaker = Some((breaker, resource.into()));
        self
    }

    /// Take a token from `limiter` under `key` before every attempt.
    ///
    /// The wait for a token is not counted against the attempt timeout.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>, key: impl Into<String>) -> Self {
        self.limiter = Some((limiter, key.into()));
        self
    }

    /// Continue a retry sequence that already made `attempts` attempts.
    ///
    /// Backoff delays and the attempt cap pick up where they left off.
    pub fn starting_at(mut self, attempts: u32) -> Self {
        self.starting_attempt = attempts;
        self
    }

    /// Abort pending waits (and further attempts) once `cancel` reads `true`.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Run `operation` without an observer.
    pub async fn run<T, E, F, Fut, C>(&self, operation: F, classifier: &C) -> RetryReport<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Classify<E> + ?Sized,
        E: Send + Sync,
    {
        self.execute(operation, classifier, &NoOpObserver).await
    }

    /// Run `operation` until it succeeds or the executor gives up.
    ///
    /// `operation` receives the 1-indexed attempt number.
    pub async fn execute<T, E, F, Fut, C, O>(
        &self,
        mut operation: F,
        classifier: &C,
        observer: &O,
    ) -> RetryReport<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Classify<E> + ?Sized,
        O: RetryObserver<E> + ?Sized,
        E: Send + Sync,
    {
        let start = Instant::now();
        let mut cancel = self.cancel.clone();
        let mut attempt = self.starting_attempt;
        let mut last_classification: Option<FailureClassification> = None;

        let give_up = |error: AttemptError<E>,
                       classification: FailureClassification,
                       reason: GiveUpReason,
                       attempts: u32|
         -> RetryReport<T, E> {
            RetryReport {
                outcome: Err(RetryFailure {
                    error,
                    classification,
                    reason,
                }),
                attempts,
                total_elapsed: start.elapsed(),
            }
        };

        loop {
            if is_cancelled(&cancel) {
                let classification = last_classification.unwrap_or_else(FailureClassification::permanent);
                return give_up(
                    AttemptError::Cancelled,
                    classification,
                    GiveUpReason::Cancelled,
                    attempt,
                );
            }

            if attempt >= self.policy.max_attempts {
                let classification = last_classification.unwrap_or_else(FailureClassification::unknown);
                return give_up(
                    AttemptError::Exhausted,
                    classification,
                    GiveUpReason::AttemptsExhausted,
                    attempt,
                );
            }

            if let Some((breaker, resource)) = &self.breaker {
                if !breaker.allow(resource).await {
                    let retry_after = breaker
                        .retry_after(resource)
                        .await
                        .unwrap_or(breaker.config().reset_timeout);
                    debug!(resource = %resource, retry_after_ms = retry_after.as_millis() as u64, "circuit open, not attempting");
                    return give_up(
                        AttemptError::CircuitOpen {
                            resource: resource.clone(),
                            retry_after,
                        },
                        FailureClassification::rate_limited(retry_after),
                        GiveUpReason::CircuitOpen,
                        attempt,
                    );
                }
            }

            if let Some((limiter, key)) = &self.limiter {
                match cancel.as_mut() {
                    Some(rx) => {
                        tokio::select! {
                            _ = limiter.acquire(key) => {}
                            _ = wait_cancelled(rx) => {
                                let classification =
                                    last_classification.unwrap_or_else(FailureClassification::permanent);
                                return give_up(
                                    AttemptError::Cancelled,
                                    classification,
                                    GiveUpReason::Cancelled,
                                    attempt,
                                );
                            }
                        }
                    }
                    None => limiter.acquire(key).await,
                }
            }

            attempt += 1;
            observer.on_attempt(attempt).await;

            let result = match self.policy.attempt_timeout {
                Some(limit) => match timeout(limit, operation(attempt)).await {
                    Ok(result) => result.map_err(AttemptError::Operation),
                    Err(_) => Err(AttemptError::Timeout(limit)),
                },
                None => operation(attempt).await.map_err(AttemptError::Operation),
            };

            let error = match result {
                Ok(value) => {
                    if let Some((breaker, resource)) = &self.breaker {
                        breaker.record_success(resource).await;
                    }
                    return RetryReport {
                        outcome: Ok(value),
                        attempts: attempt,
                        total_elapsed: start.elapsed(),
                    };
                }
                Err(error) => error,
            };

            let classification = match &error {
                AttemptError::Operation(e) => classifier.classify(e),
                _ => FailureClassification::transient(),
            };

            if let Some((breaker, resource)) = &self.breaker {
                if classification.category.indicates_unhealthy_downstream() {
                    breaker.record_failure(resource).await;
                } else {
                    // The provider answered; it is up even if it said no
                    breaker.record_success(resource).await;
                }
            }

            if !classification.is_retryable {
                return give_up(error, classification, GiveUpReason::NotRetryable, attempt);
            }
            if attempt >= self.policy.max_attempts {
                return give_up(
                    error,
                    classification,
                    GiveUpReason::AttemptsExhausted,
                    attempt,
                );
            }

            let backoff = self.policy.backoff.delay(attempt).unwrap_or_default();
            let delay = backoff.max(classification.suggested_delay.unwrap_or_default());

            observer
                .on_retry(RetryEvent {
                    attempt,
                    error: &error,
                    classification: &classification,
                    delay,
                })
                .await;

            match cancel.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = wait_cancelled(rx) => {
                            return give_up(error, classification, GiveUpReason::Cancelled, attempt);
                        }
                    }
                }
                None => sleep(delay).await,
            }

            last_classification = Some(classification);
        }
    }
}

fn is_cancelled(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().is_some_and(|rx| *rx.borrow())
}

/// Resolves once the channel reads `true`. Never resolves if the sender is gone.
async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::{
        CircuitBreakerConfig, FailureCategory, FailureClassifier, ProviderError, PlatformTable,
        classify::RetryablePredicate,
    };

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            BackoffConfig::exponential(
                Duration::from_millis(100),
                2.0,
                Duration::from_secs(10),
            ),
        )
    }

    fn classifier() -> FailureClassifier {
        let classifier = FailureClassifier::new();
        classifier.register(
            PlatformTable::new("test", Duration::from_secs(5))
                .code("429", FailureCategory::RateLimited)
                .code("400", FailureCategory::PermanentPlatformError),
        );
        classifier
    }

    fn error(code: &str) -> ProviderError {
        ProviderError::for_platform("test", code, "")
    }

    #[derive(Default)]
    struct Recorder {
        attempts: Mutex<Vec<u32>>,
        delays: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl RetryObserver<ProviderError> for Recorder {
        async fn on_attempt(&self, attempt: u32) {
            self.attempts.lock().unwrap().push(attempt);
        }

        async fn on_retry(&self, event: RetryEvent<'_, ProviderError>) {
            self.delays.lock().unwrap().push(event.delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt() {
        let report = RetryExecutor::new(fast_policy(3))
            .run(|_| async { Ok::<_, ProviderError>("done") }, &classifier())
            .await;
        assert_eq!(report.attempts, 1);
        assert_eq!(report.into_result().unwrap(), "done");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_attempted_exactly_max_times() {
        let calls = AtomicU32::new(0);
        let report = RetryExecutor::new(fast_policy(4))
            .run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(error("503")) }
                },
                &classifier(),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(report.attempts, 4);
        let failure = report.into_result().unwrap_err();
        assert_eq!(failure.reason, GiveUpReason::AttemptsExhausted);
        assert_eq!(failure.classification.category, FailureCategory::Transient);
        assert!(matches!(failure.error, AttemptError::Operation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_attempted_once() {
        let calls = AtomicU32::new(0);
        let report = RetryExecutor::new(fast_policy(5))
            .run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(error("400")) }
                },
                &classifier(),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let failure = report.into_result().unwrap_err();
        assert_eq!(failure.reason, GiveUpReason::NotRetryable);
        assert_eq!(
            failure.classification.category,
            FailureCategory::PermanentPlatformError
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_error_not_retried() {
        let report = RetryExecutor::new(fast_policy(5))
            .run(|_| async { Err::<(), _>(error("zzz")) }, &classifier())
            .await;
        assert_eq!(report.attempts, 1);
        let failure = report.into_result().unwrap_err();
        assert!(failure.classification.requires_human_review);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suggested_delay_overrides_short_backoff() {
        let started = Mutex::new(Vec::new());
        let report = RetryExecutor::new(fast_policy(5))
            .run(
                |attempt| {
                    started.lock().unwrap().push(Instant::now());
                    async move {
                        if attempt < 3 {
                            Err(error("429"))
                        } else {
                            Ok(attempt)
                        }
                    }
                },
                &classifier(),
            )
            .await;

        assert_eq!(report.attempts, 3);
        assert_eq!(report.into_result().unwrap(), 3);
        let started = started.lock().unwrap();
        assert_eq!(started.len(), 3);
        assert!(started[1] - started[0] >= Duration::from_millis(5000));
        assert!(started[2] - started[1] >= Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transient_and_retried() {
        let calls = AtomicU32::new(0);
        let policy = fast_policy(3).with_attempt_timeout(Some(Duration::from_secs(1)));
        let report = RetryExecutor::new(policy)
            .run(
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt == 1 {
                            sleep(Duration::from_secs(60)).await;
                        }
                        Ok::<_, ProviderError>(attempt)
                    }
                },
                &classifier(),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.into_result().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_sees_attempts_and_delays() {
        let recorder = Recorder::default();
        let report = RetryExecutor::new(fast_policy(3))
            .execute(
                |_| async { Err::<(), _>(error("503")) },
                &classifier(),
                &recorder,
            )
            .await;

        assert!(!report.is_success());
        assert_eq!(*recorder.attempts.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(
            *recorder.delays.lock().unwrap(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_starting_at_resumes_curve() {
        let recorder = Recorder::default();
        let report = RetryExecutor::new(fast_policy(5))
            .starting_at(2)
            .execute(
                |_| async { Err::<(), _>(error("503")) },
                &classifier(),
                &recorder,
            )
            .await;

        assert_eq!(report.attempts, 5);
        assert_eq!(*recorder.attempts.lock().unwrap(), vec![3, 4, 5]);
        assert_eq!(
            *recorder.delays.lock().unwrap(),
            vec![Duration::from_millis(400), Duration::from_millis(800)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_already_spent() {
        let calls = AtomicU32::new(0);
        let report = RetryExecutor::new(fast_policy(3))
            .starting_at(3)
            .run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, ProviderError>(()) }
                },
                &classifier(),
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let failure = report.into_result().unwrap_err();
        assert_eq!(failure.reason, GiveUpReason::AttemptsExhausted);
        assert!(matches!(failure.error, AttemptError::Exhausted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_short_circuits() {
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            threshold: 2,
            window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
        }));
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(fast_policy(10)).with_circuit_breaker(breaker.clone(), "fb");

        let report = executor
            .run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(error("503")) }
                },
                &classifier(),
            )
            .await;

        // Two failures open the circuit; the third attempt is refused
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.attempts, 2);
        let failure = report.into_result().unwrap_err();
        assert_eq!(failure.reason, GiveUpReason::CircuitOpen);
        assert_eq!(failure.classification.category, FailureCategory::RateLimited);
        assert!(failure.classification.suggested_delay.is_some());
        assert!(breaker.state("fb").await.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_health_failures_do_not_trip_breaker() {
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            threshold: 1,
            ..CircuitBreakerConfig::default()
        }));
        let executor = RetryExecutor::new(fast_policy(3)).with_circuit_breaker(breaker.clone(), "fb");
        let _ = executor
            .run(|_| async { Err::<(), _>(error("400")) }, &classifier())
            .await;
        assert!(!breaker.state("fb").await.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_pending_wait() {
        let (tx, rx) = watch::channel(false);
        let policy = RetryPolicy::new(5, BackoffConfig::constant(Duration::from_secs(3600)));
        let executor = RetryExecutor::new(policy).with_cancellation(rx);
        let calls = Arc::new(AtomicU32::new(0));

        let task_calls = calls.clone();
        let handle = tokio::spawn(async move {
            executor
                .run(
                    move |_| {
                        task_calls.fetch_add(1, Ordering::SeqCst);
                        async { Err::<(), _>(ProviderError::new("503", "")) }
                    },
                    &RetryablePredicate(|_: &ProviderError| true),
                )
                .await
        });

        sleep(Duration::from_secs(10)).await;
        let before = Instant::now();
        tx.send(true).unwrap();
        let report = handle.await.unwrap();

        assert!(before.elapsed() < Duration::from_secs(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let failure = report.into_result().unwrap_err();
        assert_eq!(failure.reason, GiveUpReason::Cancelled);
        assert!(matches!(failure.error, AttemptError::Operation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start() {
        let (_tx, rx) = watch::channel(true);
        let report = RetryExecutor::new(fast_policy(3))
            .with_cancellation(rx)
            .run(|_| async { Ok::<_, ProviderError>(()) }, &classifier())
            .await;
        assert_eq!(report.attempts, 0);
        assert_eq!(
            report.into_result().unwrap_err().reason,
            GiveUpReason::Cancelled
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_rate_limit_wait() {
        let limiter = Arc::new(RateLimiter::new(crate::RateLimitConfig::new(
            1,
            Duration::from_secs(3600),
        )));
        limiter.acquire("fb").await;

        let (tx, rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(fast_policy(3))
            .with_rate_limiter(limiter, "fb")
            .with_cancellation(rx);
        let task_calls = calls.clone();
        let handle = tokio::spawn(async move {
            executor
                .run(
                    move |_| {
                        task_calls.fetch_add(1, Ordering::SeqCst);
                        async { Ok::<_, ProviderError>(()) }
                    },
                    &classifier(),
                )
                .await
        });

        sleep(Duration::from_secs(10)).await;
        let before = Instant::now();
        tx.send(true).unwrap();
        let report = handle.await.unwrap();

        assert!(before.elapsed() < Duration::from_secs(1));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.attempts, 0);
        let failure = report.into_result().unwrap_err();
        assert_eq!(failure.reason, GiveUpReason::Cancelled);
        assert!(matches!(failure.error, AttemptError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_spaces_attempts() {
        let limiter = Arc::new(RateLimiter::new(crate::RateLimitConfig::new(
            1,
            Duration::from_secs(10),
        )));
        let policy = RetryPolicy::new(3, BackoffConfig::constant(Duration::from_millis(10)));
        let started = Mutex::new(Vec::new());
        let report = RetryExecutor::new(policy)
            .with_rate_limiter(limiter, "fb")
            .run(
                |_| {
                    started.lock().unwrap().push(Instant::now());
                    async { Err::<(), _>(error("503")) }
                },
                &classifier(),
            )
            .await;

        assert_eq!(report.attempts, 3);
        let started = started.lock().unwrap();
        assert!(started[1] - started[0] >= Duration::from_secs(9));
        assert!(started[2] - started[1] >= Duration::from_secs(9));
    }

    #[test]
    fn test_attempt_error_display() {
        let e: AttemptError<ProviderError> = AttemptError::Timeout(Duration::from_millis(1500));
        assert_eq!(e.to_string(), "attempt timed out after 1500ms");
        let e: AttemptError<ProviderError> = AttemptError::Operation(error("429"));
        assert_eq!(e.to_string(), "test error 429: ");
    }
}
