//! Exponential backoff for reconnection

use std::time::Duration;

use rt_core::config::BackoffConfig;

/// Exponential backoff for relay reconnect attempts
///
/// Delays never decrease between resets and never exceed `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay handed out after a reset
    initial: Duration,
    /// Current delay
    current: Duration,
    /// Maximum delay
    max: Duration,
    /// Multiplier
    multiplier: f64,
}

impl ExponentialBackoff {
    /// Create a new backoff from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier)
    }

    /// Create a new backoff with custom parameters
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            current: initial,
            max,
            multiplier: multiplier.max(1.0),
        }
    }

    /// Get the next delay and advance the backoff
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        // Products past what a Duration can hold saturate at `max`
        let next = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max);
        self.current = next.clamp(delay, self.max);

        delay
    }

    /// Reset the backoff to the initial delay
    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// The delay the next call to [`next_delay`](Self::next_delay) returns
    pub fn peek(&self) -> Duration {
        self.current
    }
}
