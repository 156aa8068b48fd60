//! Delays between model fallback attempts.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for fallback delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^attempt
    #[default]
    Exponential,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base
    Constant,
}

/// Jitter applied on top of the backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter.
    None,
    /// Random from 0 to delay.
    #[default]
    Full,
    /// Half fixed, half random.
    Equal,
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    2_000
}

/// Backoff configuration for moving to the next fallback model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Base delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff strategy.
    #[serde(default)]
    pub strategy: BackoffStrategy,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: JitterStrategy,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            strategy: BackoffStrategy::default(),
            jitter: JitterStrategy::default(),
        }
    }
}

impl BackoffConfig {
    /// A configuration with no delay at all.
    #[must_use]
    pub fn none() -> Self {
        Self {
            base_delay_ms: 0,
            max_delay_ms: 0,
            strategy: BackoffStrategy::Constant,
            jitter: JitterStrategy::None,
        }
    }

    /// Sets the strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Returns the delay before fallback attempt `attempt` (0-indexed).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms;
        let delay = match self.strategy {
            BackoffStrategy::Exponential => {
                base.saturating_mul(2u64.saturating_pow(attempt.min(32)))
            }
            BackoffStrategy::Linear => base.saturating_mul(u64::from(attempt) + 1),
            BackoffStrategy::Constant => base,
        }
        .min(self.max_delay_ms);

        let jittered = match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full if delay == 0 => 0,
            JitterStrategy::Full => rand::thread_rng().gen_range(0..=delay),
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };

        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_is_capped() {
        let config = BackoffConfig::default().with_jitter(JitterStrategy::None);

        assert_eq!(config.delay_for(0), Duration::from_millis(200));
        assert_eq!(config.delay_for(1), Duration::from_millis(400));
        assert_eq!(config.delay_for(10), Duration::from_millis(2_000));
    }

    #[test]
    fn test_linear() {
        let config = BackoffConfig::default()
            .with_strategy(BackoffStrategy::Linear)
            .with_jitter(JitterStrategy::None);

        assert_eq!(config.delay_for(2), Duration::from_millis(600));
    }

    #[test]
    fn test_full_jitter_within_bounds() {
        let config = BackoffConfig::default();
        for attempt in 0..5 {
            assert!(config.delay_for(attempt) <= Duration::from_millis(2_000));
        }
    }

    #[test]
    fn test_none_is_zero() {
        assert_eq!(BackoffConfig::none().delay_for(3), Duration::ZERO);
    }
}
