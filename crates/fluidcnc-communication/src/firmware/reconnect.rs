//! Reconnect backoff policy
//!
//! Delay for attempt `n` (one-based) is `base * multiplier^(n-1)`, capped.
//! After `max_attempts` the policy is exhausted until [`ReconnectPolicy::reset`].

use fluidcnc_settings::SupervisorSettings;
use std::time::Duration;

/// Exponential backoff with a cap and a bounded attempt count
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    multiplier: f64,
    cap: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_settings(&SupervisorSettings::default())
    }
}

impl ReconnectPolicy {
    /// Create a policy
    pub fn new(base: Duration, multiplier: f64, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            multiplier,
            cap,
            max_attempts,
            attempts: 0,
        }
    }

    /// Build from supervisor settings
    pub fn from_settings(settings: &SupervisorSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.reconnect_base_ms),
            settings.reconnect_multiplier,
            Duration::from_millis(settings.reconnect_cap_ms),
            settings.reconnect_max_attempts,
        )
    }

    /// Delay before the given one-based attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.base.as_millis() as f64 * self.multiplier.powi(exponent);
        let cap = self.cap.as_millis() as f64;
        if !millis.is_finite() || millis >= cap {
            self.cap
        } else {
            Duration::from_millis(millis.round() as u64)
        }
    }

    /// Advance to the next attempt. `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<(u32, Duration)> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some((self.attempts, self.delay_for(self.attempts)))
    }

    /// Attempts made since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the attempt budget is spent
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Forget previous attempts (after a successful connect)
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
