//! Queue types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use herald_resilience::{BackoffConfig, FailureClassification};

/// Stable identifier of one job instance.
///
/// Re-enqueueing a logical key with a different payload, or rescheduling it,
/// produces a new id; an idempotent duplicate enqueue returns the old one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A scheduled unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Caller-chosen logical key, e.g. `publish:post-1`.
    pub key: String,
    /// Opaque data the handler needs.
    pub payload: Value,
    /// Earliest instant the job may run.
    pub not_before: DateTime<Utc>,
    /// Attempts made so far. Survives restarts.
    pub attempt: u32,
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
    /// Higher runs first among due jobs.
    pub priority: i32,
    /// Circuit breaker / rate limiter key, e.g. `facebook:page-123`.
    pub resource_key: Option<String>,
    /// Platform used to classify handler errors.
    pub platform: Option<String>,
    pub state: JobState,
    /// Claim held by a dispatcher while the job is active.
    pub lease: Option<Lease>,
    /// Set when a cancel arrives while the job is active.
    #[serde(default)]
    pub cancel_requested: bool,
    /// Last failure, kept for diagnostics.
    pub last_error: Option<JobFailure>,
    /// Handler result of a completed job.
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the job reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for `not_before`.
    #[default]
    Pending,
    /// Claimed by a dispatcher.
    Active,
    Completed,
    /// Gave up; will not be claimed again.
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

/// A time-bounded claim on an active job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

/// Why a job failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,
    pub classification: Option<FailureClassification>,
}

/// Per-job overrides of queue defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnqueueOptions {
    pub priority: i32,
    pub max_attempts: Option<u32>,
    pub backoff: Option<BackoffConfig>,
    pub resource_key: Option<String>,
    pub platform: Option<String>,
}

impl EnqueueOptions {
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn resource_key(mut self, key: impl Into<String>) -> Self {
        self.resource_key = Some(key.into());
        self
    }

    pub fn platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }
}

/// A fully resolved enqueue request handed to a store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub key: String,
    pub payload: Value,
    pub not_before: DateTime<Utc>,
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
    pub priority: i32,
    pub resource_key: Option<String>,
    pub platform: Option<String>,
}

impl Job {
    /// Create a pending job from a request.
    pub fn new(request: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::generate(),
            key: request.key,
            payload: request.payload,
            not_before: request.not_before.max(now),
            attempt: 0,
            max_attempts: request.max_attempts,
            backoff: request.backoff,
            priority: request.priority,
            resource_key: request.resource_key,
            platform: request.platform,
            state: JobState::Pending,
            lease: None,
            cancel_requested: false,
            last_error: None,
            result: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Check if this job may be claimed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.not_before <= now
    }

    /// Check if this job is active with a lease that ran out.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Active
            && self.lease.as_ref().is_none_or(|lease| lease.expires_at <= now)
    }

    /// Check if `owner` currently holds this job.
    pub fn is_held_by(&self, id: &JobId, owner: &str) -> bool {
        self.id == *id
            && self.state == JobState::Active
            && self.lease.as_ref().is_some_and(|lease| lease.owner == owner)
    }

    /// Claim order: priority descending, then `not_before`, then age.
    pub fn claim_order(a: &Job, b: &Job) -> std::cmp::Ordering {
        b.priority
            .cmp(&a.priority)
            .then(a.not_before.cmp(&b.not_before))
            .then(a.created_at.cmp(&b.created_at))
    }
}
