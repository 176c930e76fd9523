//! Exponential reconnect backoff with a capped maximum delay.

use rand::RngExt;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            attempt: 0,
        }
    }

    /// Attempts made since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// `min(cap, base * 2^attempt)`, less up to 10% jitter.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(31));
        let delay = self.base.saturating_mul(factor).min(self.cap);
        self.attempt = self.attempt.saturating_add(1);

        let spread = delay.as_millis() as u64 / 10;
        if spread == 0 {
            return delay;
        }
        let mut rng = rand::rng();
        delay - Duration::from_millis(rng.random_range(0..=spread))
    }
}
