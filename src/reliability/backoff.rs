use clap::ValueEnum;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackoffError {
    #[error("Invalid backoff configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Every wait drawn uniformly from `[min_delay, max_delay]`
    #[default]
    Uniform,
    /// `min_delay` doubled per consecutive failure, capped at `max_delay`, with jitter
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(5_000),
            max_delay: Duration::from_millis(30_000),
            strategy: BackoffStrategy::Uniform,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), BackoffError> {
        if self.min_delay > self.max_delay {
            return Err(BackoffError::InvalidConfig(format!(
                "min_delay {:?} is greater than max_delay {:?}",
                self.min_delay, self.max_delay
            )));
        }
        Ok(())
    }
}

/// Delay source for the emitter after a batch where nothing succeeded.
///
/// Tracks consecutive failures so the exponential strategy can grow; the
/// emitter calls [`reset`](Self::reset) after any batch with a success.
#[derive(Debug)]
pub struct BackoffPolicy {
    config: BackoffConfig,
    consecutive_failures: AtomicU32,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Result<Self, BackoffError> {
        config.validate()?;
        Ok(Self {
            config,
            consecutive_failures: AtomicU32::new(0),
        })
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Records one more failure and returns how long to wait.
    pub fn next_delay(&self) -> Duration {
        let attempt = self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        match self.config.strategy {
            BackoffStrategy::Uniform => self.uniform(self.config.min_delay, self.config.max_delay),
            BackoffStrategy::Exponential => {
                let multiplier = 2_u32.saturating_pow(attempt.min(31));
                let ceiling = self
                    .config
                    .min_delay
                    .saturating_mul(multiplier)
                    .min(self.config.max_delay);
                // Jitter over the upper half of the window, never below min_delay
                let floor = (ceiling / 2).max(self.config.min_delay);
                self.uniform(floor, ceiling)
            }
        }
    }

    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    fn uniform(&self, low: Duration, high: Duration) -> Duration {
        let low_ms = low.as_millis() as u64;
        let high_ms = high.as_millis() as u64;
        if low_ms >= high_ms {
            return low;
        }
        Duration::from_millis(rand::rng().random_range(low_ms..=high_ms))
    }
}
