//! Exponential-backoff schedule for re-opening the ComfyUI event
//! connection.
//!
//! The multiplexer owns the retry loop (it must keep serving
//! subscription commands while disconnected); this module only decides
//! how long to wait between attempts.

use std::time::Duration;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Stateful view over the schedule: yields the delay for each failed
/// attempt and starts over after a successful connection.
#[derive(Debug)]
pub struct Backoff {
    config: ReconnectConfig,
    current: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current: config.initial_delay,
            config,
            attempt: 0,
        }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = next_delay(self.current, &self.config);
        self.attempt += 1;
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
        self.attempt = 0;
    }
}
