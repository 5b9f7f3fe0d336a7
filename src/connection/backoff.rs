//! Exponential reconnect backoff with additive jitter

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    jitter: Duration,
    current: Duration,
    failures: u32,
}

impl Backoff {
    /// `jitter` is capped at `floor` so a jittered delay never exceeds the
    /// next un-jittered one
    pub fn new(floor: Duration, ceiling: Duration, jitter: Duration) -> Self {
        let ceiling = ceiling.max(floor);
        let jitter = jitter.min(floor);
        Self {
            floor,
            ceiling,
            jitter,
            current: floor,
            failures: 0,
        }
    }

    /// Base delay the next failure will wait, before jitter
    pub fn current_delay(&self) -> Duration {
        self.current
    }

    /// Consecutive failures since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failure and return how long to wait before the next attempt.
    ///
    /// The base doubles after every call up to the ceiling; the returned delay
    /// adds up to `jitter` on top but never exceeds the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = base
            .checked_mul(2)
            .unwrap_or(self.ceiling)
            .min(self.ceiling);
        self.failures = self.failures.saturating_add(1);

        (base + sample_jitter(self.jitter)).min(self.ceiling)
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
        self.failures = 0;
    }
}

fn sample_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}
