//! Presence tracking with hybrid push/poll freshness.
//!
//! Pushed updates keep the cache hot while connected; a poll worker takes
//! over while disconnected. Every read applies reliability decay so stale
//! values degrade to the offline default instead of lying.

pub mod cache;
pub mod config;
pub mod error;
pub mod reliability;
pub mod source;
pub mod tracker;

pub use cache::PresenceCache;
pub use config::PresenceConfig;
pub use error::{PresenceError, PresenceResult};
pub use reliability::{
    decayed_reliability, is_trustworthy, origin_reliability, POLL_RELIABILITY,
    PUSH_RELIABILITY, RELIABILITY_FLOOR, RELIABILITY_HALF_LIFE,
};
pub use source::{HttpPresenceSource, PresenceSource};
pub use tracker::{
    adaptive_poll_interval, OwnPresenceSink, PresenceEvent, PresenceTracker,
};
