//! Subscription registry.
//!
//! The desired channel set lives here, independent of connection state.
//! The server has no memory of a torn-down session, so reconnects always
//! retransmit the full active set, never a delta. Unsubscribed entries are
//! kept inactive (not deleted) so re-subscribing is idempotent; a sweep
//! garbage-collects entries that stayed at zero consumers past a grace
//! period.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use sync_core::ChannelId;

/// Default grace period before an inactive subscription is collected.
pub const DEFAULT_GC_GRACE: Duration = Duration::from_secs(300);

/// One tracked channel.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub channel: ChannelId,
    pub active: bool,
    pub consumers: usize,
    pub subscribed_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
}

/// Consumer-counted registry of desired channels.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    entries: HashMap<ChannelId, Subscription>,
    gc_grace: Duration,
}

impl SubscriptionRegistry {
    /// Creates an empty registry with the default GC grace period.
    pub fn new() -> Self {
        Self::with_grace(DEFAULT_GC_GRACE)
    }

    /// Creates an empty registry with a custom GC grace period.
    pub fn with_grace(gc_grace: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            gc_grace,
        }
    }

    /// Adds a consumer for a channel. Returns true if the channel became
    /// active (a subscribe frame should go out if connected).
    pub fn subscribe(&mut self, channel: &ChannelId) -> bool {
        let now = Utc::now();
        let entry = self
            .entries
            .entry(channel.clone())
            .or_insert_with(|| Subscription {
                channel: channel.clone(),
                active: false,
                consumers: 0,
                subscribed_at: now,
                deactivated_at: None,
            });

        entry.consumers += 1;
        let became_active = !entry.active;
        if became_active {
            entry.active = true;
            entry.subscribed_at = now;
            entry.deactivated_at = None;
        }
        became_active
    }

    /// Removes a consumer. Returns true if the channel became inactive
    /// (downstream per-channel ephemeral state should be cleared).
    pub fn unsubscribe(&mut self, channel: &ChannelId) -> bool {
        let Some(entry) = self.entries.get_mut(channel) else {
            return false;
        };
        if !entry.active {
            return false;
        }

        entry.consumers = entry.consumers.saturating_sub(1);
        if entry.consumers == 0 {
            entry.active = false;
            entry.deactivated_at = Some(Utc::now());
            return true;
        }
        false
    }

    /// Snapshot of the full active channel set, sorted for determinism.
    pub fn active_channels(&self) -> Vec<ChannelId> {
        let mut channels: Vec<ChannelId> = self
            .entries
            .values()
            .filter(|s| s.active)
            .map(|s| s.channel.clone())
            .collect();
        channels.sort();
        channels
    }

    /// Whether the channel is currently active.
    pub fn is_active(&self, channel: &ChannelId) -> bool {
        self.entries.get(channel).is_some_and(|s| s.active)
    }

    /// Removes inactive entries past the grace period. Returns how many
    /// entries were collected.
    pub fn collect_garbage(&mut self, now: DateTime<Utc>) -> usize {
        let grace = chrono::Duration::from_std(self.gc_grace).unwrap_or(chrono::Duration::zero());
        let before = self.entries.len();
        self.entries.retain(|_, s| {
            s.active
                || s.deactivated_at
                    .map(|t| now - t < grace)
                    .unwrap_or(true)
        });
        before - self.entries.len()
    }

    /// Number of entries, active or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry has no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
