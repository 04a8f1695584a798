//! Dispatcher: the worker pool that runs due jobs.
//!
//! The run loop reaps stalled leases, claims due jobs while permits are
//! available, and spawns one task per job. Each task drives the job's handler
//! through a [`RetryExecutor`] that resumes from the persisted attempt
//! counter, shares the dispatcher's circuit breaker and rate limiter, and can
//! be cancelled through the queue.
//!
//! A running job stops early for three reasons: a cancel request, dispatcher
//! shutdown, or a lost lease. Shutdown hands the job back to the queue with
//! its attempt count and scheduled retry intact; a lost lease abandons it to
//! whichever worker holds it now.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use herald_resilience::{
    CircuitBreaker, CircuitBreakerConfig, Classify, FailureClassification, FailureClassifier,
    GiveUpReason, InMemoryCircuitStore, ProviderError, RateLimitConfig, RateLimiter, RetryEvent,
    RetryExecutor, RetryObserver, RetryPolicy,
};

use crate::state::{AttemptProgress, JobOutcome, to_chrono};
use crate::{DelayedQueue, Job, JobFailure, JobId, JobState, QueueError};

/// Capacity of the lifecycle event channel.
const EVENT_CAPACITY: usize = 1024;

/// Shortest idle wait, so a failing store cannot spin the loop.
const MIN_IDLE: Duration = Duration::from_millis(10);

/// Shortest lease the dispatcher will run with.
const MIN_LEASE: Duration = Duration::from_secs(1);

/// Caller-supplied job handler.
///
/// Called once per attempt with the job record; `job.attempt` holds the
/// 1-indexed number of the attempt being made.
pub type JobHandler = Arc<
    dyn Fn(Job) -> Pin<Box<dyn Future<Output = Result<Value, ProviderError>> + Send>>
        + Send
        + Sync,
>;

/// Wrap an async closure as a [`JobHandler`].
pub fn handler_fn<F, Fut>(f: F) -> JobHandler
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ProviderError>> + Send + 'static,
{
    Arc::new(move |job| Box::pin(f(job)))
}

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum handlers running at once.
    pub concurrency: usize,
    /// Longest idle wait between polls.
    pub poll_interval: Duration,
    pub lease_duration: Duration,
    /// Must be below `lease_duration`; a fifth of it leaves room for
    /// several failed renewals.
    pub lease_renew_interval: Duration,
    /// How long terminal records are kept for introspection.
    pub retention: Duration,
    /// Most jobs claimed per poll.
    pub batch_size: usize,
    pub worker_id: String,
    /// Breaker and rate limit key for jobs without a resource key.
    pub default_resource: String,
    pub attempt_timeout: Option<Duration>,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_secs(1),
            lease_duration: Duration::from_secs(300),
            lease_renew_interval: Duration::from_secs(60),
            retention: Duration::from_secs(24 * 60 * 60),
            batch_size: 16,
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            default_resource: "default".to_string(),
            attempt_timeout: Some(Duration::from_secs(30)),
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl DispatcherConfig {
    /// Reject settings the dispatcher cannot run with.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.lease_duration.is_zero() {
            return Err(QueueError::InvalidConfig("lease_duration must be positive".into()));
        }
        if self.lease_renew_interval.is_zero() || self.lease_renew_interval >= self.lease_duration {
            return Err(QueueError::InvalidConfig(format!(
                "lease_renew_interval ({:?}) must be positive and shorter than lease_duration ({:?})",
                self.lease_renew_interval, self.lease_duration
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(QueueError::InvalidConfig("poll_interval must be positive".into()));
        }
        Ok(())
    }

    /// Nearest valid config.
    fn sanitized(mut self) -> Self {
        if let Err(e) = self.validate() {
            warn!(error = %e, "adjusting dispatcher config");
            self.lease_duration = self.lease_duration.max(MIN_LEASE);
            if self.lease_renew_interval.is_zero() || self.lease_renew_interval >= self.lease_duration {
                self.lease_renew_interval = self.lease_duration / 2;
            }
            self.poll_interval = self.poll_interval.max(MIN_IDLE);
        }
        self
    }
}

/// Lifecycle events, ordered per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatchEvent {
    /// An attempt is starting.
    Processing { id: JobId, key: String, attempt: u32 },
    /// An attempt failed and another is scheduled.
    Retrying {
        id: JobId,
        key: String,
        attempt: u32,
        error: String,
        delay_ms: u64,
    },
    Completed {
        id: JobId,
        key: String,
        result: Value,
        attempts: u32,
    },
    Failed {
        id: JobId,
        key: String,
        error: String,
        classification: FailureClassification,
        attempts: u32,
    },
    /// The job's lease expired while it was active; it is pending again.
    Stalled { id: JobId, key: String },
    /// The circuit for the job's resource is open; it is pending until `until`.
    Deferred {
        id: JobId,
        key: String,
        until: DateTime<Utc>,
    },
    Cancelled { id: JobId, key: String },
}

impl DispatchEvent {
    pub fn key(&self) -> &str {
        match self {
            DispatchEvent::Processing { key, .. }
            | DispatchEvent::Retrying { key, .. }
            | DispatchEvent::Completed { key, .. }
            | DispatchEvent::Failed { key, .. }
            | DispatchEvent::Stalled { key, .. }
            | DispatchEvent::Deferred { key, .. }
            | DispatchEvent::Cancelled { key, .. } => key,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DispatchEvent::Completed { .. }
                | DispatchEvent::Failed { .. }
                | DispatchEvent::Cancelled { .. }
        )
    }
}

/// Bounded worker pool over a [`DelayedQueue`].
pub struct Dispatcher {
    queue: Arc<DelayedQueue>,
    handler: JobHandler,
    config: DispatcherConfig,
    classifier: Arc<FailureClassifier>,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    permits: Arc<Semaphore>,
    events: broadcast::Sender<DispatchEvent>,
    shutdown: watch::Sender<bool>,
    paused: watch::Sender<bool>,
    run_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Build a dispatcher. An invalid `config` is adjusted with a warning;
    /// call [`DispatcherConfig::validate`] first to reject it instead.
    pub fn new(queue: Arc<DelayedQueue>, handler: JobHandler, config: DispatcherConfig) -> Self {
        let config = config.sanitized();
        let breaker = CircuitBreaker::with_store(
            config.circuit_breaker.clone(),
            Arc::new(InMemoryCircuitStore::new()),
            queue.clock(),
        );
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            queue,
            handler,
            classifier: Arc::new(FailureClassifier::with_builtin_tables()),
            breaker: Arc::new(breaker),
            limiter: Arc::new(RateLimiter::new(config.rate_limit)),
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            events,
            shutdown: watch::channel(false).0,
            paused: watch::channel(false).0,
            run_handle: Mutex::new(None),
            config,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<FailureClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Share a breaker with other dispatchers.
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    /// Share a rate limiter with other dispatchers.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<DelayedQueue> {
        &self.queue
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Receive lifecycle events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    /// Start the run loop. Calling it twice has no effect.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.run_handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *handle = Some(tokio::spawn(async move { this.run().await }));
    }

    /// Stop claiming new jobs. In-flight jobs keep running.
    pub fn pause(&self) {
        info!(worker = %self.config.worker_id, "dispatcher paused");
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        info!(worker = %self.config.worker_id, "dispatcher resumed");
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Stop the run loop and wait for in-flight jobs to settle.
    ///
    /// Attempts already calling the handler run to completion. Jobs waiting
    /// out a backoff or a rate limit are released back to pending with their
    /// attempt count and next retry time kept.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        let handle = self
            .run_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "dispatcher loop panicked");
            }
        }

        let total = self.config.concurrency.max(1) as u32;
        match self.permits.acquire_many(total).await {
            Ok(permits) => drop(permits),
            Err(e) => error!(error = %e, "worker pool closed unexpectedly"),
        }
        info!(worker = %self.config.worker_id, "dispatcher closed");
    }

    fn emit(&self, event: DispatchEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn run(self: Arc<Self>) {
        info!(
            worker = %self.config.worker_id,
            concurrency = self.config.concurrency,
            "dispatcher starting"
        );
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut paused_rx = self.paused.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            if *paused_rx.borrow_and_update() {
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = paused_rx.changed() => {}
                }
                continue;
            }

            self.maintain().await;

            let permit = tokio::select! {
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown_rx.changed() => continue,
            };

            let claimed = self.claim(permit).await;
            if claimed > 0 {
                continue;
            }

            let idle = self.idle_duration().await;
            tokio::select! {
                _ = sleep(idle) => {}
                _ = self.queue.notified() => {}
                _ = shutdown_rx.changed() => {}
                _ = paused_rx.changed() => {}
            }
        }

        info!(worker = %self.config.worker_id, "dispatcher loop stopped");
    }

    /// Recover stalled jobs and drop expired terminal records.
    async fn maintain(&self) {
        match self.queue.reap_expired().await {
            Ok(reaped) => {
                for job in reaped {
                    warn!(key = %job.key, id = %job.id, attempt = job.attempt, "lease expired, job stalled");
                    self.emit(DispatchEvent::Stalled {
                        id: job.id.clone(),
                        key: job.key.clone(),
                    });
                    if job.state == JobState::Cancelled {
                        self.emit(DispatchEvent::Cancelled {
                            id: job.id,
                            key: job.key,
                        });
                    }
                }
            }
            Err(e) => error!(error = %e, "failed to reap expired leases"),
        }

        match self.queue.purge_terminal(self.config.retention).await {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "purged finished jobs"),
            Err(e) => error!(error = %e, "failed to purge finished jobs"),
        }

        let pruned = self.limiter.prune_idle().await;
        if pruned > 0 {
            debug!(pruned, "dropped idle rate limit buckets");
        }
    }

    /// Claim as many jobs as there are free permits, starting with `first`.
    ///
    /// Returns the number of jobs started.
    async fn claim(self: &Arc<Self>, first: OwnedSemaphorePermit) -> usize {
        let mut permits = vec![first];
        while permits.len() < self.config.batch_size.max(1) {
            match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(permit) => permits.push(permit),
                Err(_) => break,
            }
        }

        let jobs = match self
            .queue
            .claim_due(&self.config.worker_id, self.config.lease_duration, permits.len())
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "failed to claim due jobs");
                return 0;
            }
        };

        let started = jobs.len();
        for (job, permit) in jobs.into_iter().zip(permits) {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let _permit = permit;
                this.run_job(job).await;
            });
        }
        started
    }

    /// Time until the next pending job is due, bounded by the poll interval.
    async fn idle_duration(&self) -> Duration {
        let next = match self.queue.next_due_at().await {
            Ok(next) => next,
            Err(e) => {
                error!(error = %e, "failed to read next due time");
                None
            }
        };
        match next {
            Some(at) => (at - self.queue.now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .clamp(MIN_IDLE, self.config.poll_interval.max(MIN_IDLE)),
            None => self.config.poll_interval,
        }
    }

    #[tracing::instrument(skip(self, job), fields(key = %job.key, id = %job.id))]
    async fn run_job(self: Arc<Self>, job: Job) {
        let owner = self.config.worker_id.clone();
        let resource = job
            .resource_key
            .clone()
            .unwrap_or_else(|| self.config.default_resource.clone());

        let policy = RetryPolicy::new(job.max_attempts, job.backoff.clone())
            .with_attempt_timeout(self.config.attempt_timeout);
        let executor = RetryExecutor::new(policy)
            .with_circuit_breaker(Arc::clone(&self.breaker), resource.clone())
            .with_rate_limiter(Arc::clone(&self.limiter), resource)
            .starting_at(job.attempt);

        let stop = Arc::new(JobStop::new());
        let executor = executor.with_cancellation(stop.subscribe());
        let forwarder = self.spawn_stop_forwarder(&job, Arc::clone(&stop));

        let classifier = JobClassifier {
            inner: Arc::clone(&self.classifier),
            platform: job.platform.clone(),
        };
        let observer = JobObserver {
            dispatcher: &*self,
            job: &job,
            owner: &owner,
            stop: &stop,
        };

        let renewer = self.spawn_lease_renewer(job.clone(), Arc::clone(&stop));
        let handler = Arc::clone(&self.handler);
        let report = executor
            .execute(
                |attempt| {
                    let mut job = job.clone();
                    job.attempt = attempt;
                    handler(job)
                },
                &classifier,
                &observer,
            )
            .await;
        renewer.abort();
        forwarder.abort();

        let attempts = report.attempts;
        let elapsed_ms = report.total_elapsed.as_millis() as u64;
        match report.outcome {
            Ok(result) => {
                let finished = self
                    .queue
                    .finish(&job, &owner, attempts, JobOutcome::Completed(result.clone()))
                    .await;
                if self.settled(&job, finished) {
                    info!(attempts, elapsed_ms, "job completed");
                    self.emit(DispatchEvent::Completed {
                        id: job.id.clone(),
                        key: job.key.clone(),
                        result,
                        attempts,
                    });
                }
            }
            Err(failure) if failure.reason == GiveUpReason::CircuitOpen => {
                let delay = failure
                    .classification
                    .suggested_delay
                    .unwrap_or(self.breaker.config().reset_timeout);
                let until = self.queue.now() + to_chrono(delay);
                let released = self.queue.release(&job, &owner, attempts, until).await;
                if let Some(job) = self.settled_job(&job, released) {
                    if job.state == JobState::Cancelled {
                        self.emit(DispatchEvent::Cancelled { id: job.id, key: job.key });
                    } else {
                        warn!(until = %until, "circuit open, deferring job");
                        self.emit(DispatchEvent::Deferred {
                            id: job.id,
                            key: job.key,
                            until,
                        });
                    }
                }
            }
            Err(failure) if failure.reason == GiveUpReason::Cancelled => match stop.reason() {
                Some(StopReason::Shutdown) => self.release_for_shutdown(&job, &owner, attempts).await,
                Some(StopReason::LeaseLost) => {
                    warn!(attempts, "lease lost, abandoning job");
                }
                Some(StopReason::Cancelled) | None => {
                    let finished = self
                        .queue
                        .finish(&job, &owner, attempts, JobOutcome::Cancelled)
                        .await;
                    if self.settled(&job, finished) {
                        info!(attempts, "job cancelled");
                        self.emit(DispatchEvent::Cancelled {
                            id: job.id.clone(),
                            key: job.key.clone(),
                        });
                    }
                }
            },
            Err(failure) => {
                let message = failure.error.to_string();
                let outcome = JobOutcome::Failed(JobFailure {
                    message: message.clone(),
                    classification: Some(failure.classification.clone()),
                });
                let finished = self.queue.finish(&job, &owner, attempts, outcome).await;
                if self.settled(&job, finished) {
                    error!(
                        attempts,
                        elapsed_ms,
                        category = %failure.classification.category,
                        reason = ?failure.reason,
                        error = %message,
                        "job failed"
                    );
                    self.emit(DispatchEvent::Failed {
                        id: job.id.clone(),
                        key: job.key.clone(),
                        error: message,
                        classification: failure.classification,
                        attempts,
                    });
                }
            }
        }
    }

    /// Hand a job interrupted by shutdown back to the queue, keeping the
    /// retry time its last failed attempt scheduled.
    async fn release_for_shutdown(&self, job: &Job, owner: &str, attempts: u32) {
        let resume_at = match self.queue.get(&job.key).await {
            Ok(Some(current)) if current.id == job.id => current.not_before,
            Ok(_) => self.queue.now(),
            Err(e) => {
                warn!(error = %e, "could not read retry time, releasing for now");
                self.queue.now()
            }
        };

        let released = self.queue.release(job, owner, attempts, resume_at).await;
        if let Some(job) = self.settled_job(job, released) {
            if job.state == JobState::Cancelled {
                self.emit(DispatchEvent::Cancelled { id: job.id, key: job.key });
            } else {
                info!(attempts, resume_at = %job.not_before, "released job for shutdown");
            }
        }
    }

    fn settled(&self, job: &Job, result: Result<Job, QueueError>) -> bool {
        self.settled_job(job, result).is_some()
    }

    /// Log a store error for a finished job; the outcome is dropped.
    fn settled_job(&self, job: &Job, result: Result<Job, QueueError>) -> Option<Job> {
        match result {
            Ok(job) => Some(job),
            Err(QueueError::LeaseLost { .. }) => {
                warn!(key = %job.key, id = %job.id, "lease lost before the job finished, discarding outcome");
                None
            }
            Err(e) => {
                error!(key = %job.key, id = %job.id, error = %e, "failed to record job outcome");
                None
            }
        }
    }

    /// Turn cancel requests and shutdown into a stop for one job.
    fn spawn_stop_forwarder(&self, job: &Job, stop: Arc<JobStop>) -> JoinHandle<()> {
        let mut cancel = self.queue.cancel_signal(job);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = until_true(&mut cancel) => stop.stop(StopReason::Cancelled),
                _ = until_true(&mut shutdown) => stop.stop(StopReason::Shutdown),
            }
        })
    }

    /// Keep the job's lease alive while it runs.
    ///
    /// A failed renewal is retried on the next tick. The job is stopped once
    /// the store reports the lease gone, or once a full lease has passed
    /// without a successful renewal. A cancel request recorded by another
    /// process is picked up here too.
    fn spawn_lease_renewer(&self, job: Job, stop: Arc<JobStop>) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let owner = self.config.worker_id.clone();
        let lease = self.config.lease_duration;
        let every = self.config.lease_renew_interval;
        tokio::spawn(async move {
            let mut renewed_at = Instant::now();
            loop {
                sleep(every).await;
                match queue.renew_lease(&job, &owner, lease).await {
                    Ok(current) => {
                        renewed_at = Instant::now();
                        debug!(key = %job.key, "renewed lease");
                        if current.cancel_requested {
                            stop.stop(StopReason::Cancelled);
                        }
                    }
                    Err(QueueError::LeaseLost { .. }) => {
                        warn!(key = %job.key, "lease lost, stopping job");
                        stop.stop(StopReason::LeaseLost);
                        return;
                    }
                    Err(e) if renewed_at.elapsed() >= lease => {
                        error!(key = %job.key, error = %e, "lease ran out without renewal, stopping job");
                        stop.stop(StopReason::LeaseLost);
                        return;
                    }
                    Err(e) => {
                        warn!(key = %job.key, error = %e, "could not renew lease, retrying");
                    }
                }
            }
        })
    }
}

/// Why a running job was told to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Cancelled,
    Shutdown,
    LeaseLost,
}

/// Stop switch for one running job. The first reason given wins.
struct JobStop {
    tx: watch::Sender<bool>,
    reason: OnceLock<StopReason>,
}

impl JobStop {
    fn new() -> Self {
        Self {
            tx: watch::channel(false).0,
            reason: OnceLock::new(),
        }
    }

    fn stop(&self, reason: StopReason) {
        if self.reason.set(reason).is_ok() {
            debug!(?reason, "stopping job");
        }
        self.tx.send_replace(true);
    }

    fn reason(&self) -> Option<StopReason> {
        self.reason.get().copied()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Resolves once the channel reads `true`. Never resolves if the sender is gone.
async fn until_true(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|flag| *flag).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Classifies handler errors, falling back to the job's platform.
struct JobClassifier {
    inner: Arc<FailureClassifier>,
    platform: Option<String>,
}

impl Classify<ProviderError> for JobClassifier {
    fn classify(&self, error: &ProviderError) -> FailureClassification {
        let platform = error
            .platform
            .as_deref()
            .or(self.platform.as_deref())
            .unwrap_or_default();
        self.inner.classify(platform, error)
    }
}

/// Persists attempt progress and emits per-attempt events.
struct JobObserver<'a> {
    dispatcher: &'a Dispatcher,
    job: &'a Job,
    owner: &'a str,
    stop: &'a JobStop,
}

impl JobObserver<'_> {
    async fn record(&self, progress: AttemptProgress) {
        match self
            .dispatcher
            .queue
            .record_attempt(self.job, self.owner, progress)
            .await
        {
            Ok(_) => {}
            Err(QueueError::LeaseLost { .. }) => {
                warn!(key = %self.job.key, "lease lost while running, stopping job");
                self.stop.stop(StopReason::LeaseLost);
            }
            Err(e) => error!(key = %self.job.key, error = %e, "failed to persist attempt"),
        }
    }
}

#[async_trait]
impl<'a> RetryObserver<ProviderError> for JobObserver<'a> {
    async fn on_attempt(&self, attempt: u32) {
        self.record(AttemptProgress {
            attempt,
            retry_at: None,
            error: None,
        })
        .await;
        debug!(key = %self.job.key, attempt, "processing job");
        self.dispatcher.emit(DispatchEvent::Processing {
            id: self.job.id.clone(),
            key: self.job.key.clone(),
            attempt,
        });
    }

    async fn on_retry(&self, event: RetryEvent<'_, ProviderError>) {
        let message = event.error.to_string();
        let retry_at = self.dispatcher.queue.now() + to_chrono(event.delay);
        self.record(AttemptProgress {
            attempt: event.attempt,
            retry_at: Some(retry_at),
            error: Some(JobFailure {
                message: message.clone(),
                classification: Some(event.classification.clone()),
            }),
        })
        .await;
        warn!(
            key = %self.job.key,
            attempt = event.attempt,
            category = %event.classification.category,
            delay_ms = event.delay.as_millis() as u64,
            error = %message,
            "attempt failed, retrying"
        );
        self.dispatcher.emit(DispatchEvent::Retrying {
            id: self.job.id.clone(),
            key: self.job.key.clone(),
            attempt: event.attempt,
            error: message,
            delay_ms: event.delay.as_millis() as u64,
        });
    }
}
