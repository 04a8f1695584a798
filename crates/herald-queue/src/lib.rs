//! Delayed job queue and dispatcher for Herald.
//!
//! This crate provides:
//! - A durable queue of jobs keyed by logical key, with idempotent enqueue,
//!   atomic reschedule and cancel
//! - Lease-based claiming so a job runs on at most one dispatcher at a time,
//!   with recovery of jobs whose dispatcher died
//! - A bounded worker pool that runs handlers through the retry engine and
//!   reports lifecycle events

mod dispatcher;
mod error;
mod queue;
mod state;
mod store;
mod types;

pub use dispatcher::{DispatchEvent, Dispatcher, DispatcherConfig, JobHandler, handler_fn};
pub use error::QueueError;
pub use queue::{DelayedQueue, QueueConfig};
pub use state::{AttemptProgress, CancelOutcome, EnqueueOutcome, JobOutcome, QueueState};
pub use store::{LocalStore, QueueStore};
pub use types::{EnqueueOptions, Job, JobFailure, JobId, JobState, Lease, NewJob};
