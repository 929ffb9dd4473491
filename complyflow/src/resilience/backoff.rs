//! Exponential backoff with optional jitter.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter() -> bool {
    true
}

/// Computes the delay before a retry attempt.
///
/// `delay(attempt) = min(base * multiplier^attempt, max_delay)`, scaled by a
/// uniform factor in `[0.5, 1.0]` when jitter is enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExponentialBackoff {
    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Growth factor per attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Whether to randomise the delay.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl ExponentialBackoff {
    /// Creates a backoff policy with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the multiplier.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Returns the capped, un-jittered delay in milliseconds.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn raw_delay_ms(&self, attempt: u32) -> u64 {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let computed = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let cap = self.max_delay_ms as f64;
        if !computed.is_finite() || computed >= cap {
            self.max_delay_ms
        } else {
            computed.max(0.0) as u64
        }
    }

    /// Returns the delay before retrying after `attempt` (0-indexed).
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.raw_delay_ms(attempt);
        let ms = if self.jitter && raw > 0 {
            let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
            (raw as f64 * factor) as u64
        } else {
            raw
        };
        Duration::from_millis(ms)
    }

    /// Returns the delay, raised to the provider-suggested minimum if any.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        let computed = self.delay(attempt);
        match suggested {
            Some(min) if min > computed => min,
            _ => computed,
        }
    }
}
