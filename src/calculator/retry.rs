//! Resubmission policy for curve tasks
//!
//! A curve task is pure, so a task lost to a worker failure is simply sent
//! again. Each task waits longer before every new attempt, up to a cap.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{HazardError, Result};

/// How failed curve tasks are resubmitted (`[retry]` table of a job file)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Resubmissions allowed per task before the run fails
    pub max_retries: u32,
    /// Wait before the first resubmission (ms)
    pub initial_delay_ms: u64,
    /// Cap on the wait, before jitter (ms)
    pub max_delay_ms: u64,
    /// Growth of the wait from one resubmission to the next
    pub multiplier: f64,
    /// Stretch each wait by a random 0-25%
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Policy with the default limits
    pub fn new() -> Self {
        Self::default()
    }

    /// Give up on a task after `retries` resubmissions
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Wait `delay` before resubmitting a task the first time
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Never wait longer than `delay` between two attempts
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Growth factor of the wait
    pub fn multiplier(mut self, factor: f64) -> Self {
        self.multiplier = factor;
        self
    }

    /// Spread out resubmissions of tasks that failed together
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Wait before resubmission number `retry` (0-based), without jitter
    pub fn base_delay(&self, retry: u32) -> Duration {
        if self.initial_delay_ms == 0 {
            return Duration::ZERO;
        }
        let exponent = retry.min(64) as i32;
        let ms = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(ms.min(self.max_delay_ms as f64) as u64)
    }

    /// Check the policy, naming the offending field
    pub fn validate(&self) -> Result<()> {
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err(HazardError::config(format!(
                "retry.multiplier must be a finite number >= 1, got {}",
                self.multiplier
            )));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(HazardError::config(format!(
                "retry.initial_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.initial_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }
}

/// Resubmission state of one task
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    attempt: u32,
}

impl Backoff {
    /// Start counting resubmissions of a task
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Wait before the next resubmission; `None` once the task is out of retries
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_retries {
            return None;
        }
        let base = self.config.base_delay(self.attempt);
        self.attempt += 1;
        if self.config.jitter {
            Some(base.mul_f64(1.0 + 0.25 * rand::thread_rng().gen::<f64>()))
        } else {
            Some(base)
        }
    }

    /// Resubmissions so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
