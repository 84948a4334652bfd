//! ---
//! sim_section: "03-mqtt-bridge"
//! sim_subsection: "module"
//! sim_type: "source"
//! sim_scope: "code"
//! sim_description: "Exponential reconnect backoff."
//! sim_version: "v0.1.0"
//! sim_owner: "tbd"
//! ---
use std::time::Duration;

use lorasim_common::ReconnectConfig;
use rand::prelude::*;

/// Delay schedule `initial * 2^(attempt - 1)`, capped at `max_delay`, with at
/// most `max_retries` connection attempts per outage.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max_delay: Duration,
    max_retries: u32,
    jitter: Duration,
    rng: StdRng,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            initial: config.initial_delay,
            max_delay: config.max_delay,
            max_retries: config.max_retries,
            jitter: config.jitter,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_retries
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before retry number `attempt`, including jitter when configured.
    pub fn delay(&mut self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter.is_zero() {
            base
        } else {
            let jitter_ms = self.rng.gen_range(0..=self.jitter.as_millis().max(1) as u64);
            base + Duration::from_millis(jitter_ms)
        }
    }
}
