//! Reconnect delay policy

use crate::config::TransportConfig;
use std::time::Duration;

const FACTOR: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// `0` means unlimited
    pub max_attempts: u32,
}

impl Backoff {
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            base: Duration::from_secs(config.base_delay_secs),
            max: Duration::from_secs(config.max_delay_secs.max(config.base_delay_secs)),
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// Delay before reconnect attempt number `attempt` (1-based):
    /// `min(max, base * 1.5^(attempt-1))`
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.base.as_secs_f64() * FACTOR.powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt <= self.max_attempts
    }
}
