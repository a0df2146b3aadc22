//! Reliability scoring for cached presence.
//!
//! A cached value's confidence starts at its origin weight and halves every
//! `half_life` of age. Decay is applied at read time as a pure function, so
//! the cache never needs a background task just to age values.

use std::time::Duration;
use sync_core::PresenceOrigin;

/// Confidence assigned to a server-pushed update.
pub const PUSH_RELIABILITY: f64 = 1.0;
/// Confidence assigned to a polled value.
pub const POLL_RELIABILITY: f64 = 0.85;
/// Below this the cached value is treated as a miss.
pub const RELIABILITY_FLOOR: f64 = 0.3;
/// Age at which confidence halves.
pub const RELIABILITY_HALF_LIFE: Duration = Duration::from_secs(300);

/// Initial confidence for a value of the given origin.
pub fn origin_reliability(origin: PresenceOrigin) -> f64 {
    match origin {
        PresenceOrigin::Push => PUSH_RELIABILITY,
        PresenceOrigin::Poll => POLL_RELIABILITY,
    }
}

/// Confidence of a cached value after `age`, never negative.
pub fn decayed_reliability(initial: f64, age: Duration, half_life: Duration) -> f64 {
    if half_life.is_zero() {
        return 0.0;
    }
    let halvings = age.as_secs_f64() / half_life.as_secs_f64();
    initial * 0.5f64.powf(halvings)
}

/// Whether a decayed confidence still counts as a cache hit.
pub fn is_trustworthy(reliability: f64) -> bool {
    reliability >= RELIABILITY_FLOOR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_values_keep_their_origin_weight() {
        let r = decayed_reliability(PUSH_RELIABILITY, Duration::ZERO, RELIABILITY_HALF_LIFE);
        assert_eq!(r, 1.0);
    }

    #[test]
    fn confidence_halves_per_half_life() {
        let r = decayed_reliability(1.0, Duration::from_secs(300), RELIABILITY_HALF_LIFE);
        assert!((r - 0.5).abs() < 1e-9);
        let r = decayed_reliability(1.0, Duration::from_secs(600), RELIABILITY_HALF_LIFE);
        assert!((r - 0.25).abs() < 1e-9);
    }

    #[test]
    fn pushed_values_outlive_polled_ones() {
        let age = Duration::from_secs(500);
        let push = decayed_reliability(PUSH_RELIABILITY, age, RELIABILITY_HALF_LIFE);
        let poll = decayed_reliability(POLL_RELIABILITY, age, RELIABILITY_HALF_LIFE);
        assert!(push > poll);
        // At this age a push is still ~0.31 but a poll has fallen to ~0.27.
        assert!(is_trustworthy(push));
        assert!(!is_trustworthy(poll));
    }

    #[test]
    fn old_values_fall_below_the_floor() {
        let r = decayed_reliability(1.0, Duration::from_secs(900), RELIABILITY_HALF_LIFE);
        assert!(!is_trustworthy(r));
    }
}
