//! Replay worker.
//!
//! Drains the queue whenever the connection comes up and sweeps on an
//! interval for entries whose retry delay has elapsed. Delivery itself is
//! behind a trait so the worker never knows about the wire.

use crate::entry::OutboxEntry;
use crate::error::DeliveryError;
use crate::queue::{FailureOutcome, OutboxQueue};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use sync_core::{ChannelId, LocalId, OperationKind};
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

/// Capacity of the outbox event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Delivers one operation and returns the server-assigned id from its ack.
#[async_trait]
pub trait OperationTransport: Send + Sync {
    async fn deliver(
        &self,
        kind: OperationKind,
        local_id: LocalId,
        channel: ChannelId,
        payload: serde_json::Value,
    ) -> Result<i64, DeliveryError>;
}

/// Terminal outcomes of queued operations.
#[derive(Debug, Clone)]
pub enum OutboxEvent {
    /// The server acknowledged the operation.
    Delivered {
        local_id: LocalId,
        channel: ChannelId,
        server_id: i64,
    },
    /// Attempts exhausted; the operation is retained marked failed until
    /// the user retries it.
    Failed {
        local_id: LocalId,
        channel: ChannelId,
        error: String,
    },
}

/// Owns the replay loop over an [`OutboxQueue`].
pub struct OutboxReplayer {
    queue: Arc<OutboxQueue>,
    transport: Arc<dyn OperationTransport>,
    connected: watch::Receiver<bool>,
    events: broadcast::Sender<OutboxEvent>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
}

impl OutboxReplayer {
    /// Creates a replayer. `connected` is the session's connectivity watch;
    /// rising edges trigger an immediate drain.
    pub fn new(
        queue: Arc<OutboxQueue>,
        transport: Arc<dyn OperationTransport>,
        connected: watch::Receiver<bool>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Self {
            queue,
            transport,
            connected,
            events,
            shutdown,
            started: AtomicBool::new(false),
        }
    }

    /// Subscribes to delivery outcomes.
    pub fn events(&self) -> broadcast::Receiver<OutboxEvent> {
        self.events.subscribe()
    }

    pub fn queue(&self) -> &Arc<OutboxQueue> {
        &self.queue
    }

    /// Starts the replay loop.
    ///
    /// Panics if called more than once.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            panic!("OutboxReplayer already started");
        }
        let queue = self.queue.clone();
        let transport = self.transport.clone();
        let connected = self.connected.clone();
        let events = self.events.clone();
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(run(queue, transport, connected, events, shutdown));
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send_replace(true);
    }
}

async fn run(
    queue: Arc<OutboxQueue>,
    transport: Arc<dyn OperationTransport>,
    mut connected: watch::Receiver<bool>,
    events: broadcast::Sender<OutboxEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(queue.config().sweep_interval);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            changed = connected.changed() => {
                if changed.is_err() {
                    break;
                }
                if *connected.borrow() {
                    debug!(pending = queue.len(), "Connection up, draining outbox");
                    drain(&queue, &transport, &events).await;
                }
            }
            _ = ticker.tick() => {
                if *connected.borrow() && !queue.is_empty() {
                    drain(&queue, &transport, &events).await;
                }
            }
        }
    }
}

/// One replay pass over the due channel heads. A connection-level failure
/// aborts the pass without charging an attempt to any entry.
async fn drain(
    queue: &Arc<OutboxQueue>,
    transport: &Arc<dyn OperationTransport>,
    events: &broadcast::Sender<OutboxEvent>,
) {
    for entry in queue.due_heads(Instant::now()) {
        if let Err(e) = queue.mark_in_flight(entry.local_id) {
            warn!(local_id = %entry.local_id, error = %e, "Failed to mark entry in flight");
            continue;
        }
        match deliver_entry(transport, &entry).await {
            Ok(server_id) => {
                if let Err(e) = queue.acknowledge(entry.local_id) {
                    warn!(local_id = %entry.local_id, error = %e, "Failed to clear delivered entry");
                }
                info!(
                    local_id = %entry.local_id,
                    server_id,
                    channel = %entry.channel,
                    "Delivered queued operation"
                );
                let _ = events.send(OutboxEvent::Delivered {
                    local_id: entry.local_id,
                    channel: entry.channel,
                    server_id,
                });
            }
            Err(e) if e.is_connection_level() => {
                // The connection died under the entry; no attempt charged.
                if let Err(err) = queue.release(entry.local_id) {
                    warn!(local_id = %entry.local_id, error = %err, "Failed to release in-flight entry");
                }
                debug!("Replay paused, connection lost");
                return;
            }
            Err(e) => {
                match queue.record_failure(entry.local_id, &e.to_string(), Instant::now()) {
                    Ok(FailureOutcome::Retry { .. }) => {}
                    Ok(FailureOutcome::Failed(failed)) => {
                        let _ = events.send(OutboxEvent::Failed {
                            local_id: failed.local_id,
                            channel: failed.channel,
                            error: e.to_string(),
                        });
                    }
                    Err(err) => {
                        warn!(local_id = %entry.local_id, error = %err, "Failed to record delivery failure");
                    }
                }
            }
        }
    }
}

async fn deliver_entry(
    transport: &Arc<dyn OperationTransport>,
    entry: &OutboxEntry,
) -> Result<i64, DeliveryError> {
    transport
        .deliver(
            entry.kind,
            entry.local_id,
            entry.channel.clone(),
            entry.payload.clone(),
        )
        .await
}
