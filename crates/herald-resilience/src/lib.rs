//! Resilience primitives for Herald.
//!
//! This crate provides the pieces the dispatcher uses to decide whether and
//! when a failed publish should be attempted again:
//! - Backoff strategies (exponential, linear, constant) with jitter
//! - A failure classifier with per-platform rule tables
//! - A circuit breaker keyed per external resource, over a pluggable state store
//! - A keyed token-bucket rate limiter, over a pluggable bucket store
//! - A retry executor that ties the above together

pub mod backoff;
pub mod circuit_breaker;
pub mod classify;
mod clock;
mod error;
pub mod rate_limit;
pub mod retry;

pub use backoff::{BackoffConfig, BackoffStrategy};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitPhase, CircuitState, CircuitStore,
    InMemoryCircuitStore,
};
pub use classify::{
    Classify, FailureCategory, FailureClassification, FailureClassifier, Matcher, PlatformTable,
    ProviderError, RecoveryAction, RetryablePredicate, Rule,
};
pub use clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use error::BackoffError;
pub use rate_limit::{
    BucketState, InMemoryRateLimitStore, RateLimitConfig, RateLimitStore, RateLimiter,
};
pub use retry::{
    AttemptError, GiveUpReason, NoOpObserver, RetryEvent, RetryExecutor, RetryFailure,
    RetryObserver, RetryPolicy, RetryReport, TracingObserver,
};
