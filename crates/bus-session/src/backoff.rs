//! Reconnect backoff.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with additive jitter.
///
/// The base delay grows by the multiplier per failed attempt, clamped to
/// the ceiling. Jitter is added on top and the result is clamped again so
/// the returned delay never exceeds the ceiling. Reset only happens on a
/// confirmed successful connection, not merely on an attempt.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl Backoff {
    /// Creates a backoff starting at `initial`, capped at `max`.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
            current: initial,
        }
    }

    /// The base delay for the next attempt, before jitter.
    pub fn current_base(&self) -> Duration {
        self.current
    }

    /// Returns the jittered delay for this attempt and advances the base.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;

        let jitter_ceiling = (base.as_millis() as u64 / 4).max(1);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ceiling));

        let next = base.mul_f64(self.multiplier);
        self.current = next.min(self.max);

        (base + jitter).min(self.max)
    }

    /// Resets to the floor after a confirmed successful connection.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 1.5)
    }

    #[test]
    fn base_sequence_is_non_decreasing_and_bounded() {
        let mut b = backoff();
        let mut bases = Vec::new();
        for _ in 0..10 {
            bases.push(b.current_base());
            b.next_delay();
        }

        for pair in bases.windows(2) {
            assert!(pair[1] >= pair[0], "base sequence must be non-decreasing");
        }
        for base in &bases {
            assert!(*base <= Duration::from_secs(60));
            assert!(*base >= Duration::from_secs(1));
        }
        // 1.5^10 is still under the ceiling; two more failures saturate.
        assert!(b.current_base() < Duration::from_secs(60));
        b.next_delay();
        b.next_delay();
        assert_eq!(b.current_base(), Duration::from_secs(60));
    }

    #[test]
    fn jittered_delay_never_exceeds_ceiling() {
        let mut b = backoff();
        for _ in 0..20 {
            let delay = b.next_delay();
            assert!(delay <= Duration::from_secs(60));
            assert!(delay >= Duration::from_secs(1));
        }
    }

    #[test]
    fn reset_returns_to_floor() {
        let mut b = backoff();
        for _ in 0..5 {
            b.next_delay();
        }
        assert!(b.current_base() > Duration::from_secs(1));

        b.reset();
        assert_eq!(b.current_base(), Duration::from_secs(1));
    }

    #[test]
    fn growth_follows_multiplier() {
        let mut b = backoff();
        b.next_delay();
        assert_eq!(b.current_base(), Duration::from_millis(1500));
        b.next_delay();
        assert_eq!(b.current_base(), Duration::from_millis(2250));
    }
}
