//! Queued operation model and retry timing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use sync_core::{ChannelId, LocalId, OperationKind};
use tokio::time::Instant;

/// Delivery lifecycle of a queued operation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Queued, waiting for a delivery attempt.
    #[default]
    Pending,
    /// Handed to the transport; reverts to pending if the connection drops
    /// before the ack arrives.
    InFlight,
    /// Acknowledged by the server. Transient: acknowledged entries are
    /// deleted, never stored.
    Acknowledged,
    /// Attempts exhausted. Retained for user-initiated retry, never
    /// retried automatically.
    Failed,
}

/// A queued outbound operation. Persisted as JSON keyed by local id so a
/// restart replays exactly what was pending.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Client-generated idempotency key, assigned once at enqueue time and
    /// stable across retries and restarts.
    pub local_id: LocalId,
    pub channel: ChannelId,
    pub kind: OperationKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Delivery attempts made so far.
    pub attempts: u32,
    #[serde(default)]
    pub status: OutboxStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Not eligible for replay before this instant. Runtime-only state on
    /// the same clock as the replayer's sweep ticker; retry spacing does
    /// not survive a restart, so recovered entries are immediately due.
    #[serde(skip)]
    pub next_attempt_at: Option<Instant>,
}

impl OutboxEntry {
    pub fn new(
        kind: OperationKind,
        channel: ChannelId,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            local_id: LocalId::new(),
            channel,
            kind,
            payload,
            created_at: now,
            attempts: 0,
            status: OutboxStatus::Pending,
            last_attempt_at: None,
            last_error: None,
            next_attempt_at: None,
        }
    }

    /// Whether this entry is eligible for a delivery attempt.
    pub fn is_due(&self, now: Instant) -> bool {
        self.next_attempt_at.map_or(true, |at| now >= at)
    }
}

/// Delay before retry attempt number `attempts + 1`, doubling per failure
/// from `base` up to `max`.
pub fn retry_delay(attempts: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempts.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << shift).min(max)
}
