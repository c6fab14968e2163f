use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Full-jitter exponential backoff: attempt `n` waits a uniformly random time between zero and
/// `min(max, base * 2^n)`.
#[derive(Debug, Clone)]
pub struct Backoff<R = StdRng> {
    base: Duration,
    max: Duration,
    rng: R,
}

impl Backoff<StdRng> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self::with_rng(base, max, StdRng::from_os_rng())
    }
}

impl<R: Rng> Backoff<R> {
    pub fn with_rng(base: Duration, max: Duration, rng: R) -> Self {
        Self { base, max, rng }
    }

    /// Upper bound of the delay for `attempt`, counting from zero.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn delay(&mut self, attempt: u32) -> Duration {
        let ceiling = u64::try_from(self.ceiling(attempt).as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(self.rng.random_range(0..=ceiling))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> Backoff<StdRng> {
        Backoff::with_rng(
            Duration::from_millis(250),
            Duration::from_secs(30),
            StdRng::seed_from_u64(7),
        )
    }

    #[test]
    fn ceiling_doubles_until_capped() {
        let backoff = seeded();
        assert_eq!(backoff.ceiling(0), Duration::from_millis(250));
        assert_eq!(backoff.ceiling(1), Duration::from_millis(500));
        assert_eq!(backoff.ceiling(4), Duration::from_millis(4000));
        assert_eq!(backoff.ceiling(7), Duration::from_secs(30));
        assert_eq!(backoff.ceiling(40), Duration::from_secs(30));
    }

    #[test]
    fn delays_stay_within_the_ceiling() {
        let mut backoff = seeded();
        for attempt in 0..12 {
            for _ in 0..50 {
                assert!(backoff.delay(attempt) <= backoff.ceiling(attempt));
            }
        }
    }

    #[test]
    fn same_seed_same_schedule() {
        let mut a = seeded();
        let mut b = seeded();
        let left: Vec<_> = (0..8).map(|attempt| a.delay(attempt)).collect();
        let right: Vec<_> = (0..8).map(|attempt| b.delay(attempt)).collect();
        assert_eq!(left, right);
    }
}
