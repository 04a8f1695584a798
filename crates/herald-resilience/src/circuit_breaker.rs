//! Circuit breaker keyed per external resource.
//!
//! Each resource key (e.g. `facebook:page-123`) has its own state machine:
//!
//! - **Closed**: calls flow through; consecutive failures are counted.
//! - **Open**: `threshold` consecutive failures inside `window` open the
//!   circuit; calls are rejected until `reset_timeout` has elapsed.
//! - **Half-open**: exactly one trial call is let through. Success closes the
//!   circuit, failure re-opens it and restarts the timer.
//!
//! State lives behind [`CircuitStore`], so a single-node deployment can keep
//! it in memory while a multi-node deployment points every dispatcher at a
//! shared store. Transitions are compare-and-swap loops over that store and
//! are therefore safe under concurrent access.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{Clock, SystemClock};

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub threshold: u32,
    /// The failures must all land within this window.
    pub window: Duration,
    /// How long the circuit stays open before a trial call is allowed.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Where a circuit is in its state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum CircuitPhase {
    #[default]
    Closed,
    Open {
        opened_at: DateTime<Utc>,
    },
    HalfOpen {
        trial_started_at: DateTime<Utc>,
    },
}

/// Persisted state for one resource key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitState {
    pub failure_count: u32,
    /// Start of the current failure streak.
    pub first_failure_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub phase: CircuitPhase,
}

impl CircuitState {
    pub fn is_open(&self) -> bool {
        matches!(self.phase, CircuitPhase::Open { .. })
    }
}

/// Storage backend for circuit state.
///
/// Implementations must make `compare_and_swap` atomic with respect to every
/// other caller sharing the store.
#[async_trait]
pub trait CircuitStore: Send + Sync {
    /// Current state for `key`; unknown keys are closed.
    async fn load(&self, key: &str) -> CircuitState;

    /// Replace the state for `key` with `new` only if it still equals `expected`.
    async fn compare_and_swap(&self, key: &str, expected: &CircuitState, new: CircuitState)
    -> bool;
}

/// Process-local circuit state.
///
/// Only keys away from the default closed state are kept; a swap back to
/// closed drops the entry, so healthy resources cost nothing.
#[derive(Default)]
pub struct InMemoryCircuitStore {
    states: DashMap<String, CircuitState>,
}

impl InMemoryCircuitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a failure streak or a non-closed circuit.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[async_trait]
impl CircuitStore for InMemoryCircuitStore {
    async fn load(&self, key: &str) -> CircuitState {
        self.states
            .get(key)
            .map(|s| s.value().clone())
            .unwrap_or_default()
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &CircuitState,
        new: CircuitState,
    ) -> bool {
        let closed = CircuitState::default();
        match self.states.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get() != expected {
                    return false;
                }
                if new == closed {
                    entry.remove();
                } else {
                    *entry.get_mut() = new;
                }
                true
            }
            Entry::Vacant(entry) => {
                if *expected != closed {
                    return false;
                }
                if new != closed {
                    entry.insert(new);
                }
                true
            }
        }
    }
}

/// Per-resource circuit breaker.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    store: Arc<dyn CircuitStore>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// In-memory breaker on the system clock.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_store(
            config,
            Arc::new(InMemoryCircuitStore::new()),
            Arc::new(SystemClock),
        )
    }

    /// Breaker over an explicit store and clock.
    pub fn with_store(
        config: CircuitBreakerConfig,
        store: Arc<dyn CircuitStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state for monitoring.
    pub async fn state(&self, key: &str) -> CircuitState {
        self.store.load(key).await
    }

    /// Whether a call against `key` may proceed.
    ///
    /// Moving from open to half-open hands the caller the single trial slot.
    pub async fn allow(&self, key: &str) -> bool {
        let reset = to_chrono(self.config.reset_timeout);
        loop {
            let current = self.store.load(key).await;
            let now = self.clock.now();

            let trial_started_at = match current.phase {
                CircuitPhase::Closed => return true,
                CircuitPhase::Open { opened_at } if now - opened_at >= reset => now,
                // A trial that never reported back frees the slot after another timeout
                CircuitPhase::HalfOpen { trial_started_at } if now - trial_started_at >= reset => {
                    now
                }
                _ => return false,
            };

            let next = CircuitState {
                phase: CircuitPhase::HalfOpen { trial_started_at },
                ..current.clone()
            };
            if self.store.compare_and_swap(key, &current, next).await {
                info!(resource = key, "circuit breaker half-open, allowing trial call");
                return true;
            }
        }
    }

    /// Time left before `key` will admit a trial call, if it is open.
    pub async fn retry_after(&self, key: &str) -> Option<Duration> {
        let state = self.store.load(key).await;
        let started = match state.phase {
            CircuitPhase::Closed => return None,
            CircuitPhase::Open { opened_at } => opened_at,
            CircuitPhase::HalfOpen { trial_started_at } => trial_started_at,
        };
        let elapsed = (self.clock.now() - started).to_std().unwrap_or_default();
        Some(self.config.reset_timeout.saturating_sub(elapsed))
    }

    /// Record a successful call. Closes the circuit and clears the streak.
    pub async fn record_success(&self, key: &str) {
        loop {
            let current = self.store.load(key).await;
            if current == CircuitState::default() {
                return;
            }
            if self
                .store
                .compare_and_swap(key, &current, CircuitState::default())
                .await
            {
                if !matches!(current.phase, CircuitPhase::Closed) {
                    info!(resource = key, "circuit breaker closed, downstream recovered");
                }
                return;
            }
        }
    }

    /// Record a failed call.
    pub async fn record_failure(&self, key: &str) {
        let window = to_chrono(self.config.window);
        loop {
            let current = self.store.load(key).await;
            let now = self.clock.now();
            let mut next = current.clone();
            next.last_failure_at = Some(now);

            match current.phase {
                CircuitPhase::Closed => {
                    let in_window = current
                        .first_failure_at
                        .is_some_and(|first| now - first <= window);
                    if in_window {
                        next.failure_count = current.failure_count.saturating_add(1);
                    } else {
                        next.failure_count = 1;
                        next.first_failure_at = Some(now);
                    }
                    if next.failure_count >= self.config.threshold {
                        next.phase = CircuitPhase::Open { opened_at: now };
                    }
                }
                CircuitPhase::HalfOpen { .. } => {
                    next.failure_count = current.failure_count.saturating_add(1);
                    next.phase = CircuitPhase::Open { opened_at: now };
                }
                CircuitPhase::Open { .. } => {
                    next.failure_count = current.failure_count.saturating_add(1);
                }
            }

            if self.store.compare_and_swap(key, &current, next.clone()).await {
                match (current.phase, next.phase) {
                    (CircuitPhase::Closed, CircuitPhase::Open { .. }) => warn!(
                        resource = key,
                        failures = next.failure_count,
                        "circuit breaker opened, too many failures"
                    ),
                    (CircuitPhase::HalfOpen { .. }, _) => {
                        warn!(resource = key, "circuit breaker re-opened, trial call failed")
                    }
                    _ => {}
                }
                return;
            }
        }
    }

    /// Force `key` back to closed.
    pub async fn reset(&self, key: &str) {
        self.record_success(key).await;
    }
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
