//! ⏳ Backoff: how long to sulk before trying a bulk request again.
//!
//! Exponential, capped, and with a hard retry ceiling. Every number is explicit config;
//! there are no library defaults hiding anywhere.

use std::time::Duration;

use serde::Deserialize;

/// ⏳ Exponential backoff parameters. `initial × multiplier^n`, capped at `max_delay_ms`,
/// at most `max_retries` waits.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct BackoffPolicy {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_initial_delay_ms() -> u64 {
    50
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_max_retries() -> u32 {
    8
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl BackoffPolicy {
    /// 🔁 A fresh sequence of waits for one batch. Exhausted iterator = give up.
    pub fn delays(&self) -> BackoffDelays {
        BackoffDelays {
            next_ms: self.initial_delay_ms as f64,
            // -- 🐌 a multiplier below 1 would shrink the waits; hold them flat instead
            multiplier: self.multiplier.max(1.0),
            max_ms: self.max_delay_ms as f64,
            remaining: self.max_retries,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackoffDelays {
    next_ms: f64,
    multiplier: f64,
    max_ms: f64,
    remaining: u32,
}

impl Iterator for BackoffDelays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let the_delay = self.next_ms.min(self.max_ms);
        self.next_ms = (self.next_ms * self.multiplier).min(self.max_ms);
        Some(Duration::from_millis(the_delay as u64))
    }
}
