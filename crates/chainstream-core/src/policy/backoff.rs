//! Capped exponential backoff for reconnects.
//!
//! `delay(attempt) = min(base_delay * multiplier^attempt, max_delay)`

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the reconnect policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Growth factor applied per failed attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    /// Upper bound on any single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Consecutive failed connection attempts tolerated before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_delay_ms() -> u64 { 1_000 }
fn default_multiplier() -> u32 { 2 }
fn default_max_delay_ms() -> u64 { 30_000 }
fn default_max_attempts() -> u32 { 5 }

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Stateless policy — computes the delay for a given attempt number.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub config: ReconnectConfig,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    /// Delay to wait after `attempt` consecutive failures (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.config.multiplier)
            .checked_pow(attempt)
            .unwrap_or(u64::MAX);
        let ms = self
            .config
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.config.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Returns `true` once `attempt` failures have used up the budget.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.config.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(ReconnectConfig::default())
    }
}

/// Progress through the backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectState {
    pub attempt: u32,
    pub next_delay: Duration,
}

impl ReconnectState {
    pub fn new(policy: &ReconnectPolicy) -> Self {
        Self {
            attempt: 0,
            next_delay: policy.delay(0),
        }
    }

    /// Back to `{0, base delay}` after a successful connection.
    pub fn reset(&mut self, policy: &ReconnectPolicy) {
        *self = Self::new(policy);
    }

    /// Record one failed connection attempt.
    pub fn record_failure(&mut self, policy: &ReconnectPolicy) {
        self.attempt = self.attempt.saturating_add(1);
        self.next_delay = policy.delay(self.attempt);
    }
}
