//! The delayed job queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};
use tracing::{debug, info};

use herald_resilience::{BackoffConfig, Clock, SystemClock};

use crate::state::{AttemptProgress, CancelOutcome, JobOutcome};
use crate::{EnqueueOptions, Job, JobId, NewJob, QueueError, QueueStore};

/// Defaults applied to jobs that do not override them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub default_max_attempts: u32,
    pub default_backoff: BackoffConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            default_backoff: BackoffConfig::default(),
        }
    }
}

/// Durable queue of time-delayed jobs keyed by logical key.
pub struct DelayedQueue {
    store: Arc<dyn QueueStore>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    notify: Notify,
    /// One entry per job claimed by this process, dropped when it settles.
    cancel_signals: DashMap<JobId, watch::Sender<bool>>,
}

impl DelayedQueue {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            config: QueueConfig::default(),
            clock: Arc::new(SystemClock),
            notify: Notify::new(),
            cancel_signals: DashMap::new(),
        }
    }

    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Enqueue a job due now.
    pub async fn enqueue(
        &self,
        key: &str,
        payload: impl Serialize,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        let now = self.now();
        self.enqueue_delayed(key, payload, now, options).await
    }

    /// Enqueue a job due `delay` from now.
    pub async fn enqueue_after(
        &self,
        key: &str,
        payload: impl Serialize,
        delay: Duration,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        let not_before = self.now() + crate::state::to_chrono(delay);
        self.enqueue_delayed(key, payload, not_before, options).await
    }

    /// Enqueue a job that may not run before `not_before`.
    ///
    /// A past instant means now. If an identical job is already pending for
    /// `key` its id is returned and nothing changes.
    #[tracing::instrument(skip(self, payload, options), fields(key = %key, not_before = %not_before))]
    pub async fn enqueue_delayed(
        &self,
        key: &str,
        payload: impl Serialize,
        not_before: DateTime<Utc>,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        let max_attempts = options.max_attempts.unwrap_or(self.config.default_max_attempts);
        if max_attempts == 0 {
            return Err(QueueError::InvalidConfig("max_attempts must be at least 1".into()));
        }
        let backoff = options
            .backoff
            .unwrap_or_else(|| self.config.default_backoff.clone());
        backoff
            .validate()
            .map_err(|e| QueueError::InvalidConfig(e.to_string()))?;

        let request = NewJob {
            key: key.to_string(),
            payload: serde_json::to_value(payload)?,
            not_before,
            max_attempts,
            backoff,
            priority: options.priority,
            resource_key: options.resource_key,
            platform: options.platform,
        };

        let outcome = self.store.enqueue(request, self.now()).await?;
        if outcome.created {
            info!(key, id = %outcome.id, "enqueued job");
            self.notify.notify_one();
        } else {
            debug!(key, id = %outcome.id, "identical job already pending");
        }
        Ok(outcome.id)
    }

    /// Move the pending job for `key` to `not_before`, keeping its payload.
    ///
    /// Returns false when no pending job exists, including when the job is
    /// already running.
    #[tracing::instrument(skip(self), fields(key = %key))]
    pub async fn reschedule(&self, key: &str, not_before: DateTime<Utc>) -> Result<bool, QueueError> {
        match self.store.reschedule(key, not_before, self.now()).await? {
            Some(job) => {
                info!(key, id = %job.id, not_before = %job.not_before, "rescheduled job");
                self.notify.notify_one();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove the pending job for `key`.
    ///
    /// Returns false when nothing pending was found. A running job is not
    /// removed, but it is asked to stop: its pending retry wait is cut short
    /// and it ends cancelled.
    #[tracing::instrument(skip(self), fields(key = %key))]
    pub async fn cancel(&self, key: &str) -> Result<bool, QueueError> {
        match self.store.cancel(key, self.now()).await? {
            CancelOutcome::Removed(job) => {
                info!(key, id = %job.id, "cancelled pending job");
                Ok(true)
            }
            CancelOutcome::RequestedActive(job) => {
                info!(key, id = %job.id, "job is active, requested cancellation");
                if let Some(tx) = self.cancel_signals.get(&job.id) {
                    tx.send_replace(true);
                }
                Ok(false)
            }
            CancelOutcome::NotFound => Ok(false),
        }
    }

    /// Pending jobs due at `now`, highest priority first, then earliest.
    pub async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>, QueueError> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|job| job.is_due(now))
            .collect())
    }

    /// Pending and active jobs, without consuming them.
    pub async fn list_scheduled(&self) -> Result<Vec<Job>, QueueError> {
        self.list_scheduled_by(|_| true).await
    }

    /// Pending and active jobs matching `filter`.
    pub async fn list_scheduled_by<F>(&self, filter: F) -> Result<Vec<Job>, QueueError>
    where
        F: Fn(&Job) -> bool,
    {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|job| !job.state.is_terminal() && filter(job))
            .collect())
    }

    /// Every record, terminal ones included.
    pub async fn list_all(&self) -> Result<Vec<Job>, QueueError> {
        self.store.list().await
    }

    pub async fn get(&self, key: &str) -> Result<Option<Job>, QueueError> {
        self.store.get(key).await
    }

    /// Lease up to `limit` due jobs to `owner`.
    #[tracing::instrument(skip(self), fields(owner = %owner))]
    pub async fn claim_due(&self, owner: &str, lease: Duration, limit: usize) -> Result<Vec<Job>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let claimed = self.store.claim_due(self.now(), owner, lease, limit).await?;
        for job in &claimed {
            self.cancel_signals
                .insert(job.id.clone(), watch::channel(job.cancel_requested).0);
        }
        if !claimed.is_empty() {
            debug!(count = claimed.len(), "claimed due jobs");
        }
        Ok(claimed)
    }

    pub async fn renew_lease(&self, job: &Job, owner: &str, lease: Duration) -> Result<Job, QueueError> {
        self.store
            .renew_lease(&job.key, &job.id, owner, lease, self.now())
            .await
    }

    pub async fn record_attempt(
        &self,
        job: &Job,
        owner: &str,
        progress: AttemptProgress,
    ) -> Result<Job, QueueError> {
        self.store
            .record_attempt(&job.key, &job.id, owner, progress, self.now())
            .await
    }

    pub async fn finish(
        &self,
        job: &Job,
        owner: &str,
        attempts: u32,
        outcome: JobOutcome,
    ) -> Result<Job, QueueError> {
        let result = self
            .store
            .finish(&job.key, &job.id, owner, attempts, outcome, self.now())
            .await;
        self.clear_cancel_signal(&job.id);
        result
    }

    /// Put an active job back to pending until `not_before`.
    pub async fn release(
        &self,
        job: &Job,
        owner: &str,
        attempts: u32,
        not_before: DateTime<Utc>,
    ) -> Result<Job, QueueError> {
        let released = self
            .store
            .release(&job.key, &job.id, owner, attempts, not_before, self.now())
            .await;
        self.clear_cancel_signal(&job.id);
        if released.is_ok() {
            self.notify.notify_one();
        }
        released
    }

    /// Recover active jobs with expired leases.
    pub async fn reap_expired(&self) -> Result<Vec<Job>, QueueError> {
        let reaped = self.store.reap_expired(self.now()).await?;
        for job in &reaped {
            self.clear_cancel_signal(&job.id);
        }
        Ok(reaped)
    }

    pub async fn purge_terminal(&self, grace: Duration) -> Result<usize, QueueError> {
        self.store.purge_terminal(self.now(), grace).await
    }

    pub async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, QueueError> {
        self.store.next_due_at().await
    }

    /// Resolves when a job was enqueued, rescheduled or released.
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    /// Receiver that flips to `true` when cancellation of `job` is requested
    /// while it runs.
    ///
    /// Signals are keyed by job id, so a request that races with the job
    /// settling can never reach a later job under the same key.
    pub fn cancel_signal(&self, job: &Job) -> watch::Receiver<bool> {
        self.cancel_signals
            .entry(job.id.clone())
            .or_insert_with(|| watch::channel(job.cancel_requested).0)
            .subscribe()
    }

    fn clear_cancel_signal(&self, id: &JobId) {
        self.cancel_signals.remove(id);
    }
}
