//! Keyed token-bucket rate limiter.
//!
//! Each resource key gets a bucket holding up to `max_events` tokens that
//! refills continuously at `max_events / window`. Buckets live behind
//! [`RateLimitStore`], the same way circuit state lives behind a circuit
//! store: every limiter pointed at one store shares one budget per key, and
//! taking a token is a compare-and-swap over that store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::debug;

use crate::circuit_breaker::to_chrono;
use crate::{Clock, TokioClock};

/// Rate limit configuration: at most `max_events` per `window`.
///
/// `max_events == 0` disables limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_events: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_events: 60,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    pub fn new(max_events: u32, window: Duration) -> Self {
        Self { max_events, window }
    }

    pub fn unlimited() -> Self {
        Self {
            max_events: 0,
            window: Duration::from_secs(1),
        }
    }

    fn is_unlimited(&self) -> bool {
        self.max_events == 0 || self.window.is_zero()
    }

    /// Tokens added per second.
    fn refill_rate(&self) -> f64 {
        self.max_events as f64 / self.window.as_secs_f64()
    }
}

/// Persisted bucket for one key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub tokens: f64,
    pub refilled_at: DateTime<Utc>,
}

impl BucketState {
    fn full(config: &RateLimitConfig, now: DateTime<Utc>) -> Self {
        Self {
            tokens: config.max_events as f64,
            refilled_at: now,
        }
    }

    /// The bucket as of `now`. A clock that moved backwards adds nothing.
    fn refilled(self, config: &RateLimitConfig, now: DateTime<Utc>) -> Self {
        let elapsed = (now - self.refilled_at).to_std().unwrap_or_default();
        Self {
            tokens: (self.tokens + elapsed.as_secs_f64() * config.refill_rate())
                .min(config.max_events as f64),
            refilled_at: now.max(self.refilled_at),
        }
    }
}

/// Storage backend for rate limit buckets.
///
/// Implementations must make `compare_and_swap` atomic with respect to every
/// other caller sharing the store.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Bucket for `key`; `None` means full.
    async fn load(&self, key: &str) -> Option<BucketState>;

    /// Replace the bucket for `key` with `new` only if it still equals
    /// `expected`, where `None` expects no bucket at all.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&BucketState>,
        new: BucketState,
    ) -> bool;

    /// Drop buckets last refilled before `idle_since`. Returns how many went.
    async fn prune(&self, _idle_since: DateTime<Utc>) -> usize {
        0
    }
}

/// Process-local buckets.
#[derive(Default)]
pub struct InMemoryRateLimitStore {
    buckets: DashMap<String, BucketState>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn load(&self, key: &str) -> Option<BucketState> {
        self.buckets.get(key).map(|b| *b.value())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&BucketState>,
        new: BucketState,
    ) -> bool {
        match self.buckets.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if Some(entry.get()) != expected {
                    return false;
                }
                *entry.get_mut() = new;
                true
            }
            Entry::Vacant(entry) => {
                if expected.is_some() {
                    return false;
                }
                entry.insert(new);
                true
            }
        }
    }

    async fn prune(&self, idle_since: DateTime<Utc>) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.refilled_at >= idle_since);
        before.saturating_sub(self.buckets.len())
    }
}

/// Token buckets keyed by resource.
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Limiter with its own in-memory buckets on the tokio clock.
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_store(
            config,
            Arc::new(InMemoryRateLimitStore::new()),
            Arc::new(TokioClock::new()),
        )
    }

    /// Limiter over a store that may be shared with other limiters.
    pub fn with_store(
        config: RateLimitConfig,
        store: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Take a token, or report how long until one is available.
    async fn take(&self, key: &str) -> Result<(), Duration> {
        loop {
            let now = self.clock.now();
            let current = self.store.load(key).await;
            let bucket = match current {
                Some(bucket) => bucket.refilled(&self.config, now),
                None => BucketState::full(&self.config, now),
            };

            if bucket.tokens < 1.0 {
                let missing = 1.0 - bucket.tokens;
                return Err(Duration::from_secs_f64(missing / self.config.refill_rate()));
            }

            let next = BucketState {
                tokens: bucket.tokens - 1.0,
                ..bucket
            };
            if self
                .store
                .compare_and_swap(key, current.as_ref(), next)
                .await
            {
                return Ok(());
            }
        }
    }

    /// Take a token for `key` if one is available right now.
    pub async fn try_acquire(&self, key: &str) -> bool {
        if self.config.is_unlimited() {
            return true;
        }
        self.take(key).await.is_ok()
    }

    /// Wait until a token for `key` is available, then take it.
    pub async fn acquire(&self, key: &str) {
        if self.config.is_unlimited() {
            return;
        }
        loop {
            let wait = match self.take(key).await {
                Ok(()) => return,
                Err(wait) => wait,
            };
            debug!(resource = key, wait_ms = wait.as_millis() as u64, "rate limited, waiting");
            sleep(wait).await;
        }
    }

    /// Forget buckets idle for a whole window. They would have refilled to
    /// full, which is what a missing bucket means.
    pub async fn prune_idle(&self) -> usize {
        if self.config.is_unlimited() {
            return 0;
        }
        let idle_since = self.clock.now() - to_chrono(self.config.window);
        self.store.prune(idle_since).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_burst_up_to_max() {
        let limiter = RateLimiter::new(RateLimitConfig::new(3, Duration::from_secs(3)));
        assert!(limiter.try_acquire("a").await);
        assert!(limiter.try_acquire("a").await);
        assert!(limiter.try_acquire("a").await);
        assert!(!limiter.try_acquire("a").await);
        // Other keys have their own bucket
        assert!(limiter.try_acquire("b").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refills_over_time() {
        let limiter = RateLimiter::new(RateLimitConfig::new(2, Duration::from_secs(2)));
        assert!(limiter.try_acquire("a").await);
        assert!(limiter.try_acquire("a").await);
        assert!(!limiter.try_acquire("a").await);

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(limiter.try_acquire("a").await);
        assert!(!limiter.try_acquire("a").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_token() {
        let limiter = RateLimiter::new(RateLimitConfig::new(1, Duration::from_secs(5)));
        let start = Instant::now();
        limiter.acquire("a").await;
        limiter.acquire("a").await;
        limiter.acquire("a").await;
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_unlimited() {
        let limiter = RateLimiter::new(RateLimitConfig::unlimited());
        for _ in 0..1000 {
            assert!(limiter.try_acquire("a").await);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_limiters_sharing_a_store_share_the_budget() {
        let config = RateLimitConfig::new(3, Duration::from_secs(3));
        let store = Arc::new(InMemoryRateLimitStore::new());
        let clock = Arc::new(TokioClock::new());
        let first = RateLimiter::with_store(config, store.clone(), clock.clone());
        let second = RateLimiter::with_store(config, store.clone(), clock);

        assert!(first.try_acquire("fb").await);
        assert!(second.try_acquire("fb").await);
        assert!(first.try_acquire("fb").await);
        assert!(!second.try_acquire("fb").await);
        assert!(!first.try_acquire("fb").await);

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(second.try_acquire("fb").await);
        assert!(!first.try_acquire("fb").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_limiters_never_overspend() {
        let config = RateLimitConfig::new(5, Duration::from_secs(3600));
        let store: Arc<dyn RateLimitStore> = Arc::new(InMemoryRateLimitStore::new());
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
        let limiters: Vec<Arc<RateLimiter>> = (0..4)
            .map(|_| Arc::new(RateLimiter::with_store(config, store.clone(), clock.clone())))
            .collect();

        let mut handles = Vec::new();
        for i in 0..40 {
            let limiter = Arc::clone(&limiters[i % limiters.len()]);
            handles.push(tokio::spawn(async move { limiter.try_acquire("fb").await }));
        }
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_drops_only_idle_buckets() {
        let store = Arc::new(InMemoryRateLimitStore::new());
        let limiter = RateLimiter::with_store(
            RateLimitConfig::new(2, Duration::from_secs(10)),
            store.clone(),
            Arc::new(TokioClock::new()),
        );
        assert!(limiter.try_acquire("idle").await);
        assert!(limiter.try_acquire("busy").await);
        assert_eq!(store.len(), 2);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(limiter.try_acquire("busy").await);
        assert_eq!(limiter.prune_idle().await, 1);
        assert_eq!(store.len(), 1);
        assert!(store.load("idle").await.is_none());

        // A pruned key starts over with a full bucket
        assert!(limiter.try_acquire("idle").await);
        assert!(limiter.try_acquire("idle").await);
        assert!(!limiter.try_acquire("idle").await);
    }
}
