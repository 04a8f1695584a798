//! In-memory queue state.
//!
//! [`QueueState`] holds every job record keyed by logical key and applies all
//! queue transitions synchronously. Stores wrap it with locking and
//! persistence, so each transition here is atomic with respect to every
//! other caller of the same store.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Job, JobFailure, JobId, JobState, Lease, NewJob, QueueError};

/// Result of an enqueue request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub id: JobId,
    /// False when an identical pending job already existed.
    pub created: bool,
}

/// Result of a cancel request.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The pending job was removed.
    Removed(Job),
    /// The job is running; it was marked for non-continuation.
    RequestedActive(Job),
    NotFound,
}

/// Terminal outcome of an active job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(serde_json::Value),
    Failed(JobFailure),
    Cancelled,
}

/// Progress reported by a dispatcher between attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptProgress {
    pub attempt: u32,
    /// When the next attempt is due, if one is scheduled.
    pub retry_at: Option<DateTime<Utc>>,
    pub error: Option<JobFailure>,
}

/// All job records, keyed by logical key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueState {
    jobs: HashMap<String, Job>,
}

impl QueueState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild state from a list of records. Later duplicates win.
    pub fn from_jobs(jobs: impl IntoIterator<Item = Job>) -> Self {
        Self {
            jobs: jobs.into_iter().map(|job| (job.key.clone(), job)).collect(),
        }
    }

    /// All records in claim order.
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.values().cloned().collect();
        jobs.sort_by(Job::claim_order);
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Job> {
        self.jobs.get(key)
    }

    /// Create or replace the job for `request.key`.
    ///
    /// A pending job with the same payload is kept as is. A pending job with a
    /// different payload, or a terminal record, is replaced. An active job
    /// blocks the request.
    pub fn enqueue(&mut self, request: NewJob, now: DateTime<Utc>) -> Result<EnqueueOutcome, QueueError> {
        if request.key.is_empty() {
            return Err(QueueError::InvalidKey);
        }

        if let Some(existing) = self.jobs.get(&request.key) {
            match existing.state {
                JobState::Active => return Err(QueueError::JobActive(request.key)),
                JobState::Pending if existing.payload == request.payload => {
                    return Ok(EnqueueOutcome {
                        id: existing.id.clone(),
                        created: false,
                    });
                }
                _ => {}
            }
        }

        let job = Job::new(request, now);
        let id = job.id.clone();
        if let Some(previous) = self.jobs.insert(job.key.clone(), job) {
            debug!(key = %previous.key, previous = %previous.id, replacement = %id, "replaced job");
        }
        Ok(EnqueueOutcome { id, created: true })
    }

    /// Replace the pending job for `key` with a copy due at `not_before`.
    ///
    /// Returns the new record, or `None` when no pending job exists.
    pub fn reschedule(&mut self, key: &str, not_before: DateTime<Utc>, now: DateTime<Utc>) -> Option<Job> {
        let existing = self.jobs.get(key).filter(|job| job.state == JobState::Pending)?;

        let request = NewJob {
            key: existing.key.clone(),
            payload: existing.payload.clone(),
            not_before,
            max_attempts: existing.max_attempts,
            backoff: existing.backoff.clone(),
            priority: existing.priority,
            resource_key: existing.resource_key.clone(),
            platform: existing.platform.clone(),
        };
        let job = Job::new(request, now);
        self.jobs.insert(job.key.clone(), job.clone());
        Some(job)
    }

    pub fn cancel(&mut self, key: &str, now: DateTime<Utc>) -> CancelOutcome {
        match self.jobs.get(key).map(|job| job.state) {
            Some(JobState::Pending) => match self.jobs.remove(key) {
                Some(job) => CancelOutcome::Removed(job),
                None => CancelOutcome::NotFound,
            },
            Some(JobState::Active) => match self.jobs.get_mut(key) {
                Some(job) => {
                    job.cancel_requested = true;
                    job.updated_at = now;
                    CancelOutcome::RequestedActive(job.clone())
                }
                None => CancelOutcome::NotFound,
            },
            _ => CancelOutcome::NotFound,
        }
    }

    /// Pending jobs due at `now`, in claim order.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<Job> {
        let mut due: Vec<Job> = self.jobs.values().filter(|job| job.is_due(now)).cloned().collect();
        due.sort_by(Job::claim_order);
        due
    }

    /// Lease up to `limit` due jobs to `owner`.
    pub fn claim_due(&mut self, now: DateTime<Utc>, owner: &str, lease: Duration, limit: usize) -> Vec<Job> {
        let expires_at = now + to_chrono(lease);
        let keys: Vec<String> = self.due(now).into_iter().take(limit).map(|job| job.key).collect();

        let mut claimed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(job) = self.jobs.get_mut(&key) {
                job.state = JobState::Active;
                job.lease = Some(Lease {
                    owner: owner.to_string(),
                    expires_at,
                });
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }
        claimed
    }

    fn held_mut(&mut self, key: &str, id: &JobId, owner: &str) -> Result<&mut Job, QueueError> {
        match self.jobs.get_mut(key) {
            Some(job) if job.is_held_by(id, owner) => Ok(job),
            _ => Err(QueueError::LeaseLost {
                key: key.to_string(),
                id: id.to_string(),
            }),
        }
    }

    /// Extend the lease `owner` holds on a job.
    pub fn renew_lease(
        &mut self,
        key: &str,
        id: &JobId,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Job, QueueError> {
        let job = self.held_mut(key, id, owner)?;
        job.lease = Some(Lease {
            owner: owner.to_string(),
            expires_at: now + to_chrono(lease),
        });
        job.updated_at = now;
        Ok(job.clone())
    }

    /// Persist the attempt counter and next retry instant of an active job.
    ///
    /// The retry instant becomes `not_before`, so a job reclaimed after a
    /// crash still waits out its backoff.
    pub fn record_attempt(
        &mut self,
        key: &str,
        id: &JobId,
        owner: &str,
        progress: AttemptProgress,
        now: DateTime<Utc>,
    ) -> Result<Job, QueueError> {
        let job = self.held_mut(key, id, owner)?;
        job.attempt = progress.attempt;
        if let Some(retry_at) = progress.retry_at {
            job.not_before = retry_at;
        }
        if progress.error.is_some() {
            job.last_error = progress.error;
        }
        job.updated_at = now;
        Ok(job.clone())
    }

    /// Move an active job to a terminal state.
    pub fn finish(
        &mut self,
        key: &str,
        id: &JobId,
        owner: &str,
        attempts: u32,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> Result<Job, QueueError> {
        let job = self.held_mut(key, id, owner)?;
        job.attempt = attempts;
        job.lease = None;
        job.updated_at = now;
        job.finished_at = Some(now);
        match outcome {
            JobOutcome::Completed(result) => {
                job.state = JobState::Completed;
                job.result = Some(result);
            }
            JobOutcome::Failed(failure) => {
                job.state = JobState::Failed;
                job.last_error = Some(failure);
            }
            JobOutcome::Cancelled => job.state = JobState::Cancelled,
        }
        Ok(job.clone())
    }

    /// Return an active job to pending without finishing it.
    pub fn release(
        &mut self,
        key: &str,
        id: &JobId,
        owner: &str,
        attempts: u32,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Job, QueueError> {
        let job = self.held_mut(key, id, owner)?;
        job.attempt = attempts;
        job.lease = None;
        job.not_before = not_before.max(now);
        job.updated_at = now;
        if job.cancel_requested {
            job.state = JobState::Cancelled;
            job.finished_at = Some(now);
        } else {
            job.state = JobState::Pending;
        }
        Ok(job.clone())
    }

    /// Recover active jobs whose lease ran out.
    ///
    /// They return to pending with their attempt counter intact, or end
    /// cancelled if a cancel was requested while they ran.
    pub fn reap_expired(&mut self, now: DateTime<Utc>) -> Vec<Job> {
        self.jobs
            .values_mut()
            .filter(|job| job.lease_expired(now))
            .map(|job| {
                job.lease = None;
                job.updated_at = now;
                if job.cancel_requested {
                    job.state = JobState::Cancelled;
                    job.finished_at = Some(now);
                } else {
                    job.state = JobState::Pending;
                }
                job.clone()
            })
            .collect()
    }

    /// Delete terminal records that finished more than `grace` ago.
    pub fn purge_terminal(&mut self, now: DateTime<Utc>, grace: Duration) -> usize {
        let cutoff = now - to_chrono(grace);
        let before = self.jobs.len();
        self.jobs.retain(|_, job| {
            !(job.state.is_terminal() && job.finished_at.unwrap_or(job.updated_at) <= cutoff)
        });
        before - self.jobs.len()
    }

    /// Earliest `not_before` among pending jobs.
    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.jobs
            .values()
            .filter(|job| job.state == JobState::Pending)
            .map(|job| job.not_before)
            .min()
    }
}

/// Out-of-range durations saturate at roughly a century.
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration)
        .unwrap_or_else(|_| chrono::Duration::days(36_500))
        .min(chrono::Duration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_resilience::{BackoffConfig, FailureClassification};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::{Value, json};

    const LEASE: Duration = Duration::from_secs(300);

    fn request(key: &str, payload: Value, not_before: DateTime<Utc>) -> NewJob {
        NewJob {
            key: key.to_string(),
            payload,
            not_before,
            max_attempts: 3,
            backoff: BackoffConfig::default(),
            priority: 0,
            resource_key: None,
            platform: None,
        }
    }

    fn claim_one(state: &mut QueueState, now: DateTime<Utc>) -> Job {
        state.claim_due(now, "w1", LEASE, 1).remove(0)
    }

    // === Unit Tests ===

    #[test]
    fn test_enqueue_creates_pending_job() {
        let now = Utc::now();
        let mut state = QueueState::new();
        let outcome = state.enqueue(request("publish:1", json!(1), now), now).unwrap();
        assert!(outcome.created);
        assert_eq!(state.get("publish:1").unwrap().id, outcome.id);
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_enqueue_rejects_empty_key() {
        let now = Utc::now();
        let mut state = QueueState::new();
        assert!(matches!(
            state.enqueue(request("", json!(1), now), now),
            Err(QueueError::InvalidKey)
        ));
    }

    #[test]
    fn test_enqueue_same_payload_is_idempotent() {
        let now = Utc::now();
        let mut state = QueueState::new();
        let first = state.enqueue(request("publish:1", json!({"a": 1}), now), now).unwrap();
        let second = state
            .enqueue(request("publish:1", json!({"a": 1}), now + chrono::Duration::seconds(30)), now)
            .unwrap();
        assert_eq!(second.id, first.id);
        assert!(!second.created);
        assert_eq!(state.len(), 1);
        // The original schedule stands
        assert_eq!(state.get("publish:1").unwrap().not_before, now);
    }

    #[test]
    fn test_enqueue_different_payload_replaces() {
        let now = Utc::now();
        let mut state = QueueState::new();
        let first = state.enqueue(request("publish:1", json!(1), now), now).unwrap();
        let second = state.enqueue(request("publish:1", json!(2), now), now).unwrap();
        assert_ne!(second.id, first.id);
        assert_eq!(state.len(), 1);
        assert_eq!(state.get("publish:1").unwrap().payload, json!(2));
    }

    #[test]
    fn test_enqueue_on_active_key_rejected() {
        let now = Utc::now();
        let mut state = QueueState::new();
        state.enqueue(request("publish:1", json!(1), now), now).unwrap();
        claim_one(&mut state, now);
        assert!(matches!(
            state.enqueue(request("publish:1", json!(2), now), now),
            Err(QueueError::JobActive(key)) if key == "publish:1"
        ));
    }

    #[test]
    fn test_enqueue_replaces_terminal_record() {
        let now = Utc::now();
        let mut state = QueueState::new();
        state.enqueue(request("publish:1", json!(1), now), now).unwrap();
        let job = claim_one(&mut state, now);
        state
            .finish(&job.key, &job.id, "w1", 1, JobOutcome::Completed(json!("ok")), now)
            .unwrap();

        let again = state.enqueue(request("publish:1", json!(1), now), now).unwrap();
        assert!(again.created);
        assert_eq!(state.get("publish:1").unwrap().state, JobState::Pending);
    }

    #[test]
    fn test_reschedule_preserves_payload() {
        let now = Utc::now();
        let mut state = QueueState::new();
        let original = state
            .enqueue(request("publish:1", json!({"post": 1}), now + chrono::Duration::seconds(60)), now)
            .unwrap();

        let later = now + chrono::Duration::seconds(120);
        let job = state.reschedule("publish:1", later, now).unwrap();
        assert_eq!(job.not_before, later);
        assert_eq!(job.payload, json!({"post": 1}));
        assert_ne!(job.id, original.id);
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_reschedule_missing_or_active_returns_none() {
        let now = Utc::now();
        let mut state = QueueState::new();
        assert!(state.reschedule("publish:1", now, now).is_none());
        assert!(state.is_empty());

        state.enqueue(request("publish:1", json!(1), now), now).unwrap();
        let job = claim_one(&mut state, now);
        assert!(state.reschedule("publish:1", now, now).is_none());
        assert_eq!(state.get("publish:1").unwrap().id, job.id);
    }

    #[test]
    fn test_cancel_pending_removes() {
        let now = Utc::now();
        let mut state = QueueState::new();
        state.enqueue(request("publish:1", json!(1), now), now).unwrap();
        assert!(matches!(state.cancel("publish:1", now), CancelOutcome::Removed(_)));
        assert!(state.get("publish:1").is_none());
        assert_eq!(state.cancel("publish:1", now), CancelOutcome::NotFound);
    }

    #[test]
    fn test_cancel_active_marks_request() {
        let now = Utc::now();
        let mut state = QueueState::new();
        state.enqueue(request("publish:1", json!(1), now), now).unwrap();
        claim_one(&mut state, now);
        let requested = match state.cancel("publish:1", now) {
            CancelOutcome::RequestedActive(job) => job,
            other => panic!("unexpected outcome {other:?}"),
        };
        let job = state.get("publish:1").unwrap();
        assert_eq!(&requested, job);
        assert_eq!(job.state, JobState::Active);
        assert!(job.cancel_requested);
    }

    #[test]
    fn test_claim_order_and_limit() {
        let now = Utc::now();
        let mut state = QueueState::new();
        state
            .enqueue(request("old", json!(1), now - chrono::Duration::hours(1)), now - chrono::Duration::hours(2))
            .unwrap();
        let mut urgent = request("urgent", json!(2), now);
        urgent.priority = 5;
        state.enqueue(urgent, now).unwrap();
        state.enqueue(request("new", json!(3), now), now).unwrap();
        state
            .enqueue(request("future", json!(4), now + chrono::Duration::hours(1)), now)
            .unwrap();

        let claimed: Vec<String> = state
            .claim_due(now, "w1", LEASE, 2)
            .into_iter()
            .map(|job| job.key)
            .collect();
        assert_eq!(claimed, vec!["urgent".to_string(), "old".to_string()]);

        // Claimed jobs are invisible to the next claimant
        let rest: Vec<String> = state
            .claim_due(now, "w2", LEASE, 10)
            .into_iter()
            .map(|job| job.key)
            .collect();
        assert_eq!(rest, vec!["new".to_string()]);
    }

    #[test]
    fn test_lease_holder_checks() {
        let now = Utc::now();
        let mut state = QueueState::new();
        state.enqueue(request("publish:1", json!(1), now), now).unwrap();
        let job = claim_one(&mut state, now);

        assert!(state.renew_lease(&job.key, &job.id, "w1", LEASE, now).is_ok());
        assert!(matches!(
            state.renew_lease(&job.key, &job.id, "w2", LEASE, now),
            Err(QueueError::LeaseLost { .. })
        ));
        assert!(matches!(
            state.finish(&job.key, &JobId::generate(), "w1", 1, JobOutcome::Cancelled, now),
            Err(QueueError::LeaseLost { .. })
        ));
    }

    #[test]
    fn test_record_attempt_moves_not_before() {
        let now = Utc::now();
        let mut state = QueueState::new();
        state.enqueue(request("publish:1", json!(1), now), now).unwrap();
        let job = claim_one(&mut state, now);

        let retry_at = now + chrono::Duration::seconds(5);
        let failure = JobFailure {
            message: "error 429: slow down".into(),
            classification: Some(FailureClassification::rate_limited(Duration::from_secs(5))),
        };
        let updated = state
            .record_attempt(
                &job.key,
                &job.id,
                "w1",
                AttemptProgress {
                    attempt: 1,
                    retry_at: Some(retry_at),
                    error: Some(failure.clone()),
                },
                now,
            )
            .unwrap();
        assert_eq!(updated.attempt, 1);
        assert_eq!(updated.not_before, retry_at);
        assert_eq!(updated.last_error, Some(failure));
    }

    #[test]
    fn test_finish_records_outcome() {
        let now = Utc::now();
        let mut state = QueueState::new();
        state.enqueue(request("publish:1", json!(1), now), now).unwrap();
        let job = claim_one(&mut state, now);
        let failure = JobFailure {
            message: "error 400: bad request".into(),
            classification: Some(FailureClassification::permanent()),
        };
        let done = state
            .finish(&job.key, &job.id, "w1", 1, JobOutcome::Failed(failure.clone()), now)
            .unwrap();
        assert_eq!(done.state, JobState::Failed);
        assert_eq!(done.last_error, Some(failure));
        assert_eq!(done.finished_at, Some(now));
        assert!(done.lease.is_none());
        assert!(state.claim_due(now, "w1", LEASE, 10).is_empty());
    }

    #[test]
    fn test_release_returns_to_pending() {
        let now = Utc::now();
        let mut state = QueueState::new();
        state.enqueue(request("publish:1", json!(1), now), now).unwrap();
        let job = claim_one(&mut state, now);
        let until = now + chrono::Duration::seconds(30);
        let released = state.release(&job.key, &job.id, "w1", 2, until, now).unwrap();
        assert_eq!(released.state, JobState::Pending);
        assert_eq!(released.attempt, 2);
        assert_eq!(state.next_due_at(), Some(until));
    }

    #[test]
    fn test_reap_expired_preserves_attempt() {
        let now = Utc::now();
        let mut state = QueueState::new();
        state.enqueue(request("publish:1", json!(1), now), now).unwrap();
        let job = claim_one(&mut state, now);
        state
            .record_attempt(
                &job.key,
                &job.id,
                "w1",
                AttemptProgress {
                    attempt: 2,
                    retry_at: None,
                    error: None,
                },
                now,
            )
            .unwrap();

        assert!(state.reap_expired(now + chrono::Duration::seconds(10)).is_empty());
        let later = now + chrono::Duration::seconds(301);
        let reaped = state.reap_expired(later);
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].state, JobState::Pending);
        assert_eq!(reaped[0].attempt, 2);
        assert_eq!(state.claim_due(later, "w2", LEASE, 1).len(), 1);
    }

    #[test]
    fn test_reap_expired_honours_cancel_request() {
        let now = Utc::now();
        let mut state = QueueState::new();
        state.enqueue(request("publish:1", json!(1), now), now).unwrap();
        claim_one(&mut state, now);
        state.cancel("publish:1", now);
        let reaped = state.reap_expired(now + chrono::Duration::seconds(301));
        assert_eq!(reaped[0].state, JobState::Cancelled);
    }

    #[test]
    fn test_purge_terminal_after_grace() {
        let now = Utc::now();
        let mut state = QueueState::new();
        state.enqueue(request("done", json!(1), now), now).unwrap();
        state.enqueue(request("waiting", json!(2), now + chrono::Duration::days(7)), now).unwrap();
        let job = claim_one(&mut state, now);
        state
            .finish(&job.key, &job.id, "w1", 1, JobOutcome::Completed(Value::Null), now)
            .unwrap();

        let grace = Duration::from_secs(3600);
        assert_eq!(state.purge_terminal(now + chrono::Duration::minutes(30), grace), 0);
        assert_eq!(state.purge_terminal(now + chrono::Duration::hours(2), grace), 1);
        assert!(state.get("done").is_none());
        assert!(state.get("waiting").is_some());
    }

    // === Property-Based Tests ===

    proptest! {
        // Repeated identical enqueues leave exactly one pending job with one id
        #[test]
        fn enqueue_is_idempotent(repeats in 1usize..10, payload in any::<u32>()) {
            let now = Utc::now();
            let mut state = QueueState::new();
            let first = state.enqueue(request("k", json!(payload), now), now).unwrap();
            for _ in 0..repeats {
                let again = state.enqueue(request("k", json!(payload), now), now).unwrap();
                prop_assert_eq!(&again.id, &first.id);
            }
            prop_assert_eq!(state.len(), 1);
        }

        // At most one record per key, whatever the mix of keys
        #[test]
        fn one_record_per_key(keys in proptest::collection::vec(0u8..5, 1..40)) {
            let now = Utc::now();
            let mut state = QueueState::new();
            for (i, key) in keys.iter().enumerate() {
                let _ = state.enqueue(request(&format!("k{key}"), json!(i), now), now);
            }
            let mut distinct = keys.clone();
            distinct.sort();
            distinct.dedup();
            prop_assert_eq!(state.len(), distinct.len());
        }

        // Claimed jobs are never claimed again while their lease holds
        #[test]
        fn no_double_claim(count in 1usize..20, first_batch in 0usize..20) {
            let now = Utc::now();
            let mut state = QueueState::new();
            for i in 0..count {
                state.enqueue(request(&format!("k{i}"), json!(i), now), now).unwrap();
            }
            let a = state.claim_due(now, "a", LEASE, first_batch);
            let b = state.claim_due(now, "b", LEASE, count);
            prop_assert_eq!(a.len() + b.len(), count);
            for job in &a {
                prop_assert!(b.iter().all(|other| other.key != job.key));
            }
        }
    }
}
