// src/utils/backoff.rs
use rand::Rng;
use std::time::Duration;

/// Reconnect delay schedule: base doubling per attempt, capped, with a
/// small random jitter so a fleet of agents does not reconnect in lockstep.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max_delay: Duration,
    jitter_factor: f64,
    attempt: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        // 5s, 10s, 20s ... capped at 5 minutes, matching the broadcaster's
        // recommended reconnect schedule.
        Self::new(Duration::from_secs(5), Duration::from_secs(300), 0.1)
    }
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max_delay: Duration, jitter_factor: f64) -> Self {
        Self {
            base,
            max_delay,
            // Negative jitter would panic in gen_range.
            jitter_factor: jitter_factor.max(0.0),
            attempt: 0,
        }
    }

    /// Delay before the next attempt; increments the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let doubled = self.base.saturating_mul(2u32.saturating_pow(self.attempt));
        let capped = doubled.min(self.max_delay);

        let jitter_range = capped.as_secs_f64() * self.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        self.attempt = self.attempt.saturating_add(1);
        Duration::from_secs_f64((capped.as_secs_f64() + jitter).max(0.0))
    }

    /// Call after a connection proved stable.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
