//! Bus wire frames.
//!
//! Frames are JSON objects with a `type` discriminator. The subscribe
//! frame always carries the full desired channel set plus the last
//! processed cursor (`last`) so the server can replay what was missed.

use serde::{Deserialize, Serialize};
use sync_core::{BusNotification, ChannelId, LocalId, OperationKind};

/// Client → server frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientFrameType {
    Subscribe,
    Operation,
    Ping,
}

/// A frame sent to the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub frame_type: ClientFrameType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<ChannelId>>,
    /// Last processed notification id; the server replays ids above this.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<OperationKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_id: Option<LocalId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl ClientFrame {
    fn new(frame_type: ClientFrameType) -> Self {
        Self {
            frame_type,
            channels: None,
            last: None,
            kind: None,
            local_id: None,
            channel: None,
            payload: None,
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    /// Creates a SUBSCRIBE frame carrying the full desired channel set.
    pub fn subscribe(channels: Vec<ChannelId>, last: i64) -> Self {
        Self {
            channels: Some(channels),
            last: Some(last),
            ..Self::new(ClientFrameType::Subscribe)
        }
    }

    /// Creates an OPERATION frame keyed by the client-generated local id.
    pub fn operation(
        kind: OperationKind,
        local_id: LocalId,
        channel: ChannelId,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind: Some(kind),
            local_id: Some(local_id),
            channel: Some(channel),
            payload: Some(payload),
            ..Self::new(ClientFrameType::Operation)
        }
    }

    /// Creates a PING heartbeat frame.
    pub fn ping() -> Self {
        Self::new(ClientFrameType::Ping)
    }

    /// Serializes the frame to JSON text.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Server → client frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerFrameType {
    Notifications,
    Pong,
    Error,
}

/// A frame received from the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerFrame {
    #[serde(rename = "type")]
    pub frame_type: ServerFrameType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications: Option<Vec<BusNotification>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerFrame {
    /// Parses a frame from JSON text.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Builds a notifications frame (used by tests and simulators).
    pub fn notifications(notifications: Vec<BusNotification>) -> Self {
        Self {
            frame_type: ServerFrameType::Notifications,
            notifications: Some(notifications),
            error: None,
        }
    }

    /// Serializes the frame to JSON text.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
