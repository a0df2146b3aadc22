//! Glue between components: the outbox delivers through the session, and
//! typing/own-presence signals enter the outbox as operations.

use async_trait::async_trait;
use bus_session::{BusSession, SessionError};
use presence_tracker::OwnPresenceSink;
use serde_json::json;
use std::sync::Arc;
use sync_core::{ChannelId, LocalId, OperationKind, PresenceStatus};
use sync_outbox::{DeliveryError, OperationTransport, OutboxQueue};
use tracing::warn;
use typing_tracker::TypingSignalSink;

/// Channel own-presence operations are filed under; they have no
/// conversation channel of their own.
pub const OWN_PRESENCE_CHANNEL: &str = "bus.presence";

/// Delivers outbox operations through the bus session, mapping session
/// errors onto the outbox's retry semantics.
pub struct SessionOperationTransport {
    session: Arc<BusSession>,
}

impl SessionOperationTransport {
    pub fn new(session: Arc<BusSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl OperationTransport for SessionOperationTransport {
    async fn deliver(
        &self,
        kind: OperationKind,
        local_id: LocalId,
        channel: ChannelId,
        payload: serde_json::Value,
    ) -> Result<i64, DeliveryError> {
        match self
            .session
            .deliver_operation(kind, local_id, channel, payload)
            .await
        {
            Ok(server_id) => Ok(server_id),
            Err(SessionError::NotConnected) | Err(SessionError::Closed) => {
                Err(DeliveryError::NotConnected)
            }
            Err(SessionError::Timeout) => Err(DeliveryError::Timeout),
            Err(e) => Err(DeliveryError::Rejected(e.to_string())),
        }
    }
}

/// Queues typing signals as outbox operations so they ride the same
/// delivery and retry path as everything else outbound.
pub struct OutboxTypingSink {
    queue: Arc<OutboxQueue>,
}

impl OutboxTypingSink {
    pub fn new(queue: Arc<OutboxQueue>) -> Self {
        Self { queue }
    }
}

impl TypingSignalSink for OutboxTypingSink {
    fn send_typing(&self, channel: &ChannelId, is_typing: bool) {
        if let Err(e) = self.queue.enqueue(
            OperationKind::TypingSignal,
            channel.clone(),
            json!({ "is_typing": is_typing }),
        ) {
            warn!(channel = %channel, error = %e, "Failed to queue typing signal");
        }
    }
}

/// Queues own-presence updates as outbox operations.
pub struct OutboxPresenceSink {
    queue: Arc<OutboxQueue>,
}

impl OutboxPresenceSink {
    pub fn new(queue: Arc<OutboxQueue>) -> Self {
        Self { queue }
    }
}

impl OwnPresenceSink for OutboxPresenceSink {
    fn publish(&self, status: PresenceStatus) {
        if let Err(e) = self.queue.enqueue(
            OperationKind::PresenceUpdate,
            ChannelId::from_string(OWN_PRESENCE_CHANNEL),
            json!({ "status": status }),
        ) {
            warn!(error = %e, "Failed to queue own-presence update");
        }
    }
}
