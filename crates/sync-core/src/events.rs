//! Unified event stream surfaced to the application layer.

use crate::notification::MessagePayload;
use crate::types::{ChannelId, ConnectionState, LocalId, PresenceStatus, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a cached presence value came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceOrigin {
    Push,
    Poll,
}

/// Cached presence state for a single user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub origin: PresenceOrigin,
    /// Confidence that this value still reflects current truth, in [0, 1].
    pub reliability: f64,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PresenceRecord {
    /// The record returned when nothing trustworthy is cached for a user.
    pub fn offline(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            status: PresenceStatus::Offline,
            last_seen: None,
            last_activity: None,
            origin: PresenceOrigin::Poll,
            reliability: 0.0,
            cached_at: now,
            expires_at: now,
        }
    }
}

/// Events emitted by the sync client.
///
/// Delivered over a broadcast channel: many independent listeners,
/// best-effort delivery, a lagging listener never blocks the others.
#[derive(Clone, Debug)]
pub enum SyncEvent {
    /// The bus session changed state.
    ConnectionStateChanged(ConnectionState),
    /// A deduplicated, decoded message notification.
    Message {
        channel: ChannelId,
        message: MessagePayload,
    },
    /// A tracked user's presence record was refreshed.
    PresenceChanged {
        user_id: UserId,
        record: PresenceRecord,
    },
    /// The set of users typing in a channel changed.
    TypingChanged {
        channel: ChannelId,
        users: Vec<UserId>,
    },
    /// A server-side record changed under queued local edits. Consumers
    /// feed this to the conflict resolver; no policy is applied here.
    RecordChanged {
        model: String,
        record_id: i64,
        fields: serde_json::Value,
    },
    /// A queued operation was acknowledged by the server.
    OutboxAcknowledged { local_id: LocalId, server_id: i64 },
    /// A queued operation exhausted its attempts and will not retry.
    OutboxFailed { local_id: LocalId, error: String },
    /// Credentials could not be refreshed; the user must re-authenticate.
    AuthRequired { reason: String },
}
