//! Error types for resilience primitives.

use thiserror::Error;

/// Errors that can occur when computing a backoff delay.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackoffError {
    /// Attempt numbers are 1-indexed.
    #[error("attempt must be at least 1, got {0}")]
    InvalidAttempt(u32),

    /// Backoff configuration is unusable.
    #[error("invalid backoff configuration: {0}")]
    InvalidConfig(String),
}
