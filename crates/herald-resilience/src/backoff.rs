//! Backoff strategies.
//!
//! A backoff strategy maps a 1-indexed attempt number to the delay to wait
//! before the next attempt. The ceiling is applied before jitter, and the
//! jittered value is clamped back under the ceiling.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::BackoffError;

/// How the delay grows between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base * factor^(attempt-1)`, capped at `max_delay_ms`.
    Exponential {
        base_ms: u64,
        factor: f64,
        max_delay_ms: u64,
    },
    /// `base + increment*(attempt-1)`, capped at `max_delay_ms`.
    Linear {
        base_ms: u64,
        increment_ms: u64,
        max_delay_ms: u64,
    },
    /// Always `base_ms`.
    Constant { base_ms: u64 },
}

/// A backoff strategy plus optional jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub strategy: BackoffStrategy,
    /// Jitter fraction in `[0.0, 1.0]`. A delay `d` becomes uniform in
    /// `[d*(1-j), d*(1+j)]`.
    #[serde(default)]
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential {
                base_ms: 1_000,
                factor: 2.0,
                max_delay_ms: 300_000,
            },
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Exponential backoff without jitter.
    pub fn exponential(base: Duration, factor: f64, max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential {
                base_ms: base.as_millis() as u64,
                factor,
                max_delay_ms: max_delay.as_millis() as u64,
            },
            jitter: 0.0,
        }
    }

    /// Linear backoff without jitter.
    pub fn linear(base: Duration, increment: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Linear {
                base_ms: base.as_millis() as u64,
                increment_ms: increment.as_millis() as u64,
                max_delay_ms: max_delay.as_millis() as u64,
            },
            jitter: 0.0,
        }
    }

    /// Constant backoff without jitter.
    pub fn constant(base: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Constant {
                base_ms: base.as_millis() as u64,
            },
            jitter: 0.0,
        }
    }

    /// Set the jitter fraction.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<(), BackoffError> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(BackoffError::InvalidConfig(format!(
                "jitter must be within [0, 1], got {}",
                self.jitter
            )));
        }
        match &self.strategy {
            BackoffStrategy::Exponential {
                base_ms,
                factor,
                max_delay_ms,
            } => {
                if !factor.is_finite() || *factor < 1.0 {
                    return Err(BackoffError::InvalidConfig(format!(
                        "exponential factor must be >= 1, got {}",
                        factor
                    )));
                }
                if max_delay_ms < base_ms {
                    return Err(BackoffError::InvalidConfig(
                        "max delay is smaller than base delay".to_string(),
                    ));
                }
            }
            BackoffStrategy::Linear {
                base_ms,
                max_delay_ms,
                ..
            } => {
                if max_delay_ms < base_ms {
                    return Err(BackoffError::InvalidConfig(
                        "max delay is smaller than base delay".to_string(),
                    ));
                }
            }
            BackoffStrategy::Constant { .. } => {}
        }
        Ok(())
    }

    /// The configured ceiling, if the strategy has one.
    pub fn max_delay(&self) -> Option<Duration> {
        match &self.strategy {
            BackoffStrategy::Exponential { max_delay_ms, .. }
            | BackoffStrategy::Linear { max_delay_ms, .. } => {
                Some(Duration::from_millis(*max_delay_ms))
            }
            BackoffStrategy::Constant { .. } => None,
        }
    }

    /// Delay before the attempt after `attempt`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Result<Duration, BackoffError> {
        if attempt < 1 {
            return Err(BackoffError::InvalidAttempt(attempt));
        }
        let n = attempt - 1;

        let millis = match &self.strategy {
            BackoffStrategy::Exponential {
                base_ms,
                factor,
                max_delay_ms,
            } => {
                // Large exponents saturate to infinity, which the cap absorbs
                let raw = *base_ms as f64 * factor.powi(n.min(1024) as i32);
                raw.min(*max_delay_ms as f64) as u64
            }
            BackoffStrategy::Linear {
                base_ms,
                increment_ms,
                max_delay_ms,
            } => base_ms
                .saturating_add(increment_ms.saturating_mul(n as u64))
                .min(*max_delay_ms),
            BackoffStrategy::Constant { base_ms } => *base_ms,
        };

        Ok(Duration::from_millis(millis))
    }

    /// Delay before the attempt after `attempt`, with random jitter.
    pub fn delay(&self, attempt: u32) -> Result<Duration, BackoffError> {
        let sample = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=1.0)
        } else {
            0.5
        };
        self.delay_with_sample(attempt, sample)
    }

    /// Delay with an explicit jitter sample in `[0.0, 1.0]`.
    ///
    /// A sample of 0.0 yields the low end of the jitter band, 1.0 the high end.
    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> Result<Duration, BackoffError> {
        let capped = self.base_delay(attempt)?;
        if self.jitter <= 0.0 {
            return Ok(capped);
        }

        let jitter = self.jitter.min(1.0);
        let offset = (sample.clamp(0.0, 1.0) * 2.0 - 1.0) * jitter;
        let jittered = capped.as_millis() as f64 * (1.0 + offset);
        let mut millis = jittered.max(0.0) as u64;

        if let Some(max) = self.max_delay() {
            millis = millis.min(max.as_millis() as u64);
        }

        Ok(Duration::from_millis(millis))
    }
}
