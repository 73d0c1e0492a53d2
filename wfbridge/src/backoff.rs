//! Exponential backoff for pool replacement retries.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_ms;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(with = "duration_ms")]
    pub initial_interval: Duration,
    pub multiplier: f64,
    #[serde(with = "duration_ms")]
    pub max_interval: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            multiplier: 1.5,
            max_interval: Duration::from_secs(60),
        }
    }
}

/// Unbounded exponential backoff; the caller decides when to give up.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current: Duration,
    attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial_interval,
            config,
            attempts: 0,
        }
    }

    /// Interval to wait before the next attempt.
    pub fn next_interval(&mut self) -> Duration {
        let interval = self.current.min(self.config.max_interval);
        self.attempts += 1;
        self.current = self
            .current
            .mul_f64(self.config.multiplier.max(1.0))
            .min(self.config.max_interval);
        interval
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_then_caps() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig {
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_interval: Duration::from_secs(5),
        });

        let intervals: Vec<_> = (0..5).map(|_| backoff.next_interval().as_secs()).collect();
        assert_eq!(intervals, vec![1, 2, 4, 5, 5]);
        assert_eq!(backoff.attempts(), 5);
    }

    #[test]
    fn default_seed_is_one_second() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig::default());
        assert_eq!(backoff.next_interval(), Duration::from_secs(1));
        assert_eq!(backoff.next_interval(), Duration::from_millis(1500));
    }
}
