//! Reconnect backoff
//!
//! Exponential growth from `initial` up to `max`, with each delay drawn
//! uniformly from the upper half of the current step.

use rand::Rng;
use std::time::Duration;

use crate::config::PoolTuning;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempt: 0,
        }
    }

    pub fn from_tuning(tuning: &PoolTuning) -> Self {
        Self::new(tuning.backoff_initial, tuning.backoff_max)
    }

    /// Delays handed out so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Upper bound of the next delay, without jitter
    pub fn ceiling(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(31));
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);

        let ceiling_ms = ceiling.as_millis() as u64;
        let delay_ms = rand::thread_rng().gen_range(ceiling_ms / 2..=ceiling_ms);
        Duration::from_millis(delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_and_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));

        let expected_ceilings = [100, 200, 400, 800, 1000, 1000];
        for ceiling in expected_ceilings {
            assert_eq!(backoff.ceiling(), Duration::from_millis(ceiling));
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(ceiling / 2));
            assert!(delay <= Duration::from_millis(ceiling));
        }
        assert_eq!(backoff.attempt(), 6);
    }

    #[test]
    fn test_many_attempts_do_not_overflow() {
        let mut backoff = Backoff::new(Duration::from_millis(1), Duration::from_secs(5));
        for _ in 0..100 {
            assert!(backoff.next_delay() <= Duration::from_secs(5));
        }
    }
}
