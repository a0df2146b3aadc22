//! Decoded server notification model.
//!
//! The bus pushes batches of notifications, each carrying a server-assigned
//! monotonically increasing id, a channel, a `kind` discriminator and a
//! loosely shaped payload. Known kinds decode into typed payloads; unknown
//! kinds are preserved as data so the sequencer can log and drop them
//! without treating them as failures.

use crate::types::{ChannelId, LocalId, PresenceStatus, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single notification as delivered by the server bus.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BusNotification {
    /// Server-assigned id, monotonically increasing per subscription scope.
    pub id: i64,
    /// Channel this notification belongs to.
    pub channel: ChannelId,
    /// Discriminator for the payload shape.
    pub kind: String,
    /// Raw payload; decoded lazily by [`BusNotification::decode`].
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A new chat message pushed to a subscribed channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    /// Server-side message id.
    pub id: i64,
    /// Author of the message.
    pub author_id: UserId,
    /// Message body (already rendered by the server).
    pub body: String,
    /// Echo of the client-generated id when this message originated locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<LocalId>,
    /// Server timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
}

/// A presence change for a tracked user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub user_id: UserId,
    pub status: PresenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

/// A typing start/stop signal from another member of a channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TypingPayload {
    pub user_id: UserId,
    pub is_typing: bool,
}

/// Server acknowledgment of an outbound operation, correlated by local id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationAckPayload {
    pub local_id: LocalId,
    pub server_id: i64,
}

/// A server-side record change relevant to queued local edits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordChangedPayload {
    pub model: String,
    pub record_id: i64,
    /// Changed fields as a name → value map.
    pub fields: serde_json::Value,
}

/// Typed view of a notification payload.
#[derive(Clone, Debug)]
pub enum NotificationKind {
    Message(MessagePayload),
    Presence(PresencePayload),
    Typing(TypingPayload),
    OperationAck(OperationAckPayload),
    RecordChanged(RecordChangedPayload),
    /// A kind this client does not understand. Logged and dropped upstream.
    Unknown { kind: String },
}

impl BusNotification {
    /// Decodes the payload according to the `kind` discriminator.
    ///
    /// Unknown kinds succeed with [`NotificationKind::Unknown`]; a known
    /// kind with a malformed payload is a protocol error and the frame is
    /// dropped by the caller.
    pub fn decode(&self) -> Result<NotificationKind, serde_json::Error> {
        let kind = match self.kind.as_str() {
            "message" => NotificationKind::Message(serde_json::from_value(self.payload.clone())?),
            "presence" => NotificationKind::Presence(serde_json::from_value(self.payload.clone())?),
            "typing" => NotificationKind::Typing(serde_json::from_value(self.payload.clone())?),
            "ack" => {
                NotificationKind::OperationAck(serde_json::from_value(self.payload.clone())?)
            }
            "record_changed" => {
                NotificationKind::RecordChanged(serde_json::from_value(self.payload.clone())?)
            }
            other => NotificationKind::Unknown {
                kind: other.to_string(),
            },
        };
        Ok(kind)
    }
}
