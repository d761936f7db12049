//! Exponential backoff shared by reconnection, handler retries and consumer restarts
//!
//! Pure decision logic only; callers do their own sleeping.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff: `base_delay_ms * factor^(attempt-1)`, capped at `max_delay_ms`,
/// for at most `max_attempts` total attempts. Omitted fields take the
/// [`Default`] values when deserialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            factor: 2.0,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

/// Outcome of asking the policy whether another attempt is allowed
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Wait `delay`, then make attempt number `attempt`
    Retry { attempt: u32, delay: Duration },
    /// Attempts exhausted
    GiveUp { attempts: u32 },
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, factor: f64, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay_ms: base_delay.as_millis() as u64,
            factor,
            max_delay_ms: max_delay.as_millis() as u64,
            max_attempts,
        }
    }

    /// No waiting between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            base_delay_ms: 0,
            factor: 1.0,
            max_delay_ms: 0,
            max_attempts,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let raw = self.base_delay_ms as f64 * self.factor.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Decide what to do after `attempts_made` failed attempts
    pub fn decide(&self, attempts_made: u32) -> RetryDecision {
        if attempts_made >= self.max_attempts {
            return RetryDecision::GiveUp {
                attempts: attempts_made,
            };
        }

        RetryDecision::Retry {
            attempt: attempts_made + 1,
            delay: self.delay_after(attempts_made),
        }
    }

    /// Upper bound on time spent sleeping across all attempts
    pub fn max_total_delay(&self) -> Duration {
        (1..self.max_attempts.max(1)).map(|a| self.delay_after(a)).sum()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".to_string());
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err("factor must be a finite number >= 1.0".to_string());
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err("base_delay_ms must not exceed max_delay_ms".to_string());
        }
        Ok(())
    }
}
