//! Presence tracker tuning.

use std::time::Duration;

/// Tuning knobs for the presence tracker.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Window during which newly tracked ids are coalesced into one lookup.
    pub lookup_debounce: Duration,
    /// Maximum ids per batched lookup; the rest wait for the next batch.
    pub max_lookup_batch: usize,
    /// Minimum spacing between own-presence sends.
    pub own_presence_throttle: Duration,
    /// How long a cached record stays valid.
    pub record_ttl: Duration,
    /// Cache ceiling; above it, lowest-hit records are evicted.
    pub max_entries: usize,
    /// How often expired records are swept out.
    pub sweep_interval: Duration,
    /// Poll interval while disconnected.
    pub poll_base: Duration,
    /// Poll interval when the user was active recently.
    pub poll_active: Duration,
    /// Poll interval while the app is backgrounded.
    pub poll_backgrounded: Duration,
    /// Hard lower bound on the poll interval.
    pub poll_min: Duration,
    /// Hard upper bound on the poll interval.
    pub poll_max: Duration,
    /// Activity within this window selects the active poll interval.
    pub activity_window: Duration,
    /// Recent lookup error rate above this doubles the poll interval.
    pub error_rate_threshold: f64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            lookup_debounce: Duration::from_secs(3),
            max_lookup_batch: 25,
            own_presence_throttle: Duration::from_secs(30),
            record_ttl: Duration::from_secs(600),
            max_entries: 500,
            sweep_interval: Duration::from_secs(60),
            poll_base: Duration::from_secs(30),
            poll_active: Duration::from_secs(10),
            poll_backgrounded: Duration::from_secs(120),
            poll_min: Duration::from_secs(10),
            poll_max: Duration::from_secs(300),
            activity_window: Duration::from_secs(60),
            error_rate_threshold: 0.3,
        }
    }
}
