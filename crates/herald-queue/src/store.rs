//! Queue storage backends.
//!
//! [`QueueStore`] is the seam between the queue and its persistence. Every
//! method is one atomic transition, which is what keeps two dispatchers from
//! claiming the same job. [`LocalStore`] serves a single host, either purely
//! in memory or backed by a JSON snapshot file shared through a lock file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::state::{AttemptProgress, CancelOutcome, EnqueueOutcome, JobOutcome, QueueState};
use crate::{Job, JobId, NewJob, QueueError};

/// Atomic queue operations over some storage.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn enqueue(&self, request: NewJob, now: DateTime<Utc>) -> Result<EnqueueOutcome, QueueError>;

    async fn reschedule(
        &self,
        key: &str,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError>;

    async fn cancel(&self, key: &str, now: DateTime<Utc>) -> Result<CancelOutcome, QueueError>;

    async fn get(&self, key: &str) -> Result<Option<Job>, QueueError>;

    /// Every record, in claim order.
    async fn list(&self) -> Result<Vec<Job>, QueueError>;

    /// Lease up to `limit` due jobs to `owner`.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        owner: &str,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError>;

    async fn renew_lease(
        &self,
        key: &str,
        id: &JobId,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Job, QueueError>;

    async fn record_attempt(
        &self,
        key: &str,
        id: &JobId,
        owner: &str,
        progress: AttemptProgress,
        now: DateTime<Utc>,
    ) -> Result<Job, QueueError>;

    async fn finish(
        &self,
        key: &str,
        id: &JobId,
        owner: &str,
        attempts: u32,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> Result<Job, QueueError>;

    async fn release(
        &self,
        key: &str,
        id: &JobId,
        owner: &str,
        attempts: u32,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Job, QueueError>;

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>, QueueError>;

    async fn purge_terminal(&self, now: DateTime<Utc>, grace: Duration) -> Result<usize, QueueError>;

    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, QueueError>;
}

const SNAPSHOT_VERSION: u32 = 1;

/// On-disk snapshot format.
#[derive(Debug, Serialize, Deserialize)]
struct QueueSnapshot {
    version: u32,
    jobs: Vec<Job>,
}

/// Single-host store.
///
/// With a path, every operation takes an exclusive lock on `<path>.lock`,
/// reloads the snapshot and, for mutations, rewrites the whole queue to a
/// temp file renamed over the snapshot. Any number of handles and processes
/// may share one file. A mutation whose snapshot cannot be written is rolled
/// back and reported as an error.
pub struct LocalStore {
    state: Mutex<QueueState>,
    path: Option<PathBuf>,
}

impl LocalStore {
    /// Volatile store. Jobs are lost on exit.
    pub fn memory() -> Self {
        Self {
            state: Mutex::new(QueueState::new()),
            path: None,
        }
    }

    /// Durable store at `path`, loading the existing snapshot if any.
    #[tracing::instrument]
    pub async fn open(path: impl AsRef<Path> + std::fmt::Debug) -> Result<Self, QueueError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let state = {
            let _lock = lock_snapshot(&path).await?;
            load_snapshot(&path).await?
        };

        info!(path = %path.display(), jobs = state.len(), "opened queue store");
        Ok(Self {
            state: Mutex::new(state),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn read<T>(&self, f: impl FnOnce(&QueueState) -> T) -> Result<T, QueueError> {
        let mut state = self.state.lock().await;
        if let Some(path) = &self.path {
            let _lock = lock_snapshot(path).await?;
            *state = load_snapshot(path).await?;
        }
        Ok(f(&state))
    }

    /// Apply `f` to the latest snapshot and persist the result if it changed
    /// anything.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut QueueState) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let mut state = self.state.lock().await;
        let Some(path) = &self.path else {
            return f(&mut state);
        };

        let _lock = lock_snapshot(path).await?;
        *state = load_snapshot(path).await?;

        let before = state.clone();
        let result = match f(&mut state) {
            Ok(result) => result,
            Err(e) => {
                *state = before;
                return Err(e);
            }
        };
        if *state == before {
            return Ok(result);
        }

        if let Err(e) = write_snapshot(path, &state).await {
            error!(path = %path.display(), error = %e, "failed to persist queue, rolling back");
            *state = before;
            return Err(e);
        }
        Ok(result)
    }
}

/// `path` with `suffix` appended to its file name.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Block until this handle holds the snapshot lock. Dropping the file
/// releases it.
///
/// The lock lives on a sibling file because the snapshot itself is replaced
/// by rename on every write.
async fn lock_snapshot(path: &Path) -> Result<File, QueueError> {
    let lock_path = sibling(path, ".lock");
    tokio::task::spawn_blocking(move || {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        file.lock_exclusive()?;
        Ok(file)
    })
    .await
    .map_err(|e| QueueError::Io(std::io::Error::other(e)))?
}

/// Read the snapshot at `path`. A missing file is an empty queue.
async fn load_snapshot(path: &Path) -> Result<QueueState, QueueError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(QueueState::new()),
        Err(e) => return Err(e.into()),
    };

    let snapshot: QueueSnapshot = serde_json::from_slice(&bytes)?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(QueueError::InvalidConfig(format!(
            "unsupported snapshot version {} in {}",
            snapshot.version,
            path.display()
        )));
    }
    Ok(QueueState::from_jobs(snapshot.jobs))
}

async fn write_snapshot(path: &Path, state: &QueueState) -> Result<(), QueueError> {
    let snapshot = QueueSnapshot {
        version: SNAPSHOT_VERSION,
        jobs: state.jobs(),
    };
    let bytes = serde_json::to_vec_pretty(&snapshot)?;

    let tmp = sibling(path, ".tmp");
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), jobs = snapshot.jobs.len(), "persisted queue");
    Ok(())
}

#[async_trait]
impl QueueStore for LocalStore {
    async fn enqueue(&self, request: NewJob, now: DateTime<Utc>) -> Result<EnqueueOutcome, QueueError> {
        self.mutate(|state| state.enqueue(request, now)).await
    }

    async fn reschedule(
        &self,
        key: &str,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        self.mutate(|state| Ok(state.reschedule(key, not_before, now))).await
    }

    async fn cancel(&self, key: &str, now: DateTime<Utc>) -> Result<CancelOutcome, QueueError> {
        self.mutate(|state| Ok(state.cancel(key, now))).await
    }

    async fn get(&self, key: &str) -> Result<Option<Job>, QueueError> {
        self.read(|state| state.get(key).cloned()).await
    }

    async fn list(&self) -> Result<Vec<Job>, QueueError> {
        self.read(QueueState::jobs).await
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        owner: &str,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        self.mutate(|state| Ok(state.claim_due(now, owner, lease, limit))).await
    }

    async fn renew_lease(
        &self,
        key: &str,
        id: &JobId,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Job, QueueError> {
        self.mutate(|state| state.renew_lease(key, id, owner, lease, now)).await
    }

    async fn record_attempt(
        &self,
        key: &str,
        id: &JobId,
        owner: &str,
        progress: AttemptProgress,
        now: DateTime<Utc>,
    ) -> Result<Job, QueueError> {
        self.mutate(|state| state.record_attempt(key, id, owner, progress, now)).await
    }

    async fn finish(
        &self,
        key: &str,
        id: &JobId,
        owner: &str,
        attempts: u32,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> Result<Job, QueueError> {
        self.mutate(|state| state.finish(key, id, owner, attempts, outcome, now)).await
    }

    async fn release(
        &self,
        key: &str,
        id: &JobId,
        owner: &str,
        attempts: u32,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Job, QueueError> {
        self.mutate(|state| state.release(key, id, owner, attempts, not_before, now)).await
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>, QueueError> {
        self.mutate(|state| Ok(state.reap_expired(now))).await
    }

    async fn purge_terminal(&self, now: DateTime<Utc>, grace: Duration) -> Result<usize, QueueError> {
        self.mutate(|state| Ok(state.purge_terminal(now, grace))).await
    }

    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, QueueError> {
        self.read(QueueState::next_due_at).await
    }
}
