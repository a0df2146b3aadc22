//! The sync client facade.
//!
//! Owns one instance of each component and a routing task that fans
//! session notifications out to the right owner and merges every
//! component's events into one application-facing stream.

use crate::config::SyncClientConfig;
use crate::wiring::{OutboxPresenceSink, OutboxTypingSink, SessionOperationTransport};
use bus_session::{AuthProvider, BusSession, BusTransport, SessionEvent};
use presence_tracker::{PresenceEvent, PresenceSource, PresenceTracker};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use sync_core::{
    ChannelId, ConnectionState, LocalId, NotificationKind, OperationKind, PresenceRecord,
    PresenceStatus, StateStore, SyncEvent, UserId,
};
use sync_outbox::{OutboxEntry, OutboxEvent, OutboxQueue, OutboxReplayer, OutboxResult};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};
use typing_tracker::{TypingCoordinator, TypingEvent};

/// Capacity of the unified event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The real-time sync client. One instance per authenticated account.
pub struct SyncClient {
    session: Arc<BusSession>,
    queue: Arc<OutboxQueue>,
    replayer: OutboxReplayer,
    presence: PresenceTracker,
    typing: TypingCoordinator,
    events: broadcast::Sender<SyncEvent>,
    routing: Mutex<Option<tokio::task::JoinHandle<()>>>,
    started: AtomicBool,
}

impl SyncClient {
    /// Builds the client with injected collaborators. Nothing connects
    /// until [`start`](Self::start).
    pub fn new(
        config: SyncClientConfig,
        transport: Arc<dyn BusTransport>,
        auth: Arc<dyn AuthProvider>,
        store: Arc<dyn StateStore>,
        presence_source: Arc<dyn PresenceSource>,
    ) -> OutboxResult<Self> {
        let session = Arc::new(BusSession::new(
            config.session,
            transport,
            auth,
            store.clone(),
        ));
        let queue = Arc::new(OutboxQueue::recover(store, config.outbox)?);
        let replayer = OutboxReplayer::new(
            queue.clone(),
            Arc::new(SessionOperationTransport::new(session.clone())),
            session.connected_watch(),
        );
        let typing = TypingCoordinator::spawn(
            config.typing,
            Arc::new(OutboxTypingSink::new(queue.clone())),
        );
        let presence = PresenceTracker::spawn(
            config.presence,
            presence_source,
            Arc::new(OutboxPresenceSink::new(queue.clone())),
            session.connected_watch(),
        );
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            session,
            queue,
            replayer,
            presence,
            typing,
            events,
            routing: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    /// Starts the session, the outbox replayer and the event routing task.
    ///
    /// Panics if called more than once.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            panic!("SyncClient already started");
        }
        // Routing must be subscribed before the session can emit anything.
        let handle = tokio::spawn(route_events(
            self.session.events(),
            self.replayer.events(),
            self.presence.events(),
            self.typing.events(),
            self.presence.clone(),
            self.typing.clone(),
            self.events.clone(),
        ));
        *self.routing.lock().expect("lock poisoned") = Some(handle);

        self.session.start();
        self.replayer.start();
    }

    /// Subscribes to the unified event stream.
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Highest processed notification id.
    pub fn cursor(&self) -> i64 {
        self.session.cursor()
    }

    /// Adds a consumer for a channel.
    pub fn subscribe(&self, channel: &ChannelId) {
        self.session.subscribe(channel);
    }

    /// Removes a consumer for a channel; when the last consumer leaves,
    /// the channel's typing state is dropped with it.
    pub fn unsubscribe(&self, channel: &ChannelId) {
        if self.session.unsubscribe(channel) {
            self.typing.clear_channel(channel.clone());
        }
    }

    /// Queues an operation for delivery. Works offline; the returned local
    /// id correlates the eventual ack or failure event.
    pub fn send(
        &self,
        kind: OperationKind,
        channel: ChannelId,
        payload: serde_json::Value,
    ) -> OutboxResult<LocalId> {
        self.queue.enqueue(kind, channel, payload).map(|e| e.local_id)
    }

    /// Queues a chat message.
    pub fn send_message(&self, channel: ChannelId, body: &str) -> OutboxResult<LocalId> {
        self.send(
            OperationKind::SendMessage,
            channel,
            json!({ "body": body }),
        )
    }

    /// Operations that exhausted their attempts and await a retry decision.
    pub fn failed_operations(&self) -> Vec<OutboxEntry> {
        self.queue.failed_entries()
    }

    /// Requeues a failed operation with a fresh attempt budget.
    pub fn retry_operation(&self, local_id: LocalId) -> OutboxResult<()> {
        self.queue.retry(local_id).map(|_| ())
    }

    pub fn track_presence(&self, users: Vec<UserId>) {
        self.presence.track_users(users);
    }

    pub fn untrack_presence(&self, users: Vec<UserId>) {
        self.presence.untrack_users(users);
    }

    /// Current presence for a user (offline default on a cache miss).
    pub fn presence_of(&self, user_id: UserId) -> PresenceRecord {
        self.presence.presence_of(user_id)
    }

    pub fn set_own_presence(&self, status: PresenceStatus) {
        self.presence.set_own_presence(status);
    }

    /// Reports a local keystroke; typing implies activity for presence
    /// polling purposes.
    pub fn start_typing(&self, channel: ChannelId) {
        self.presence.touch_activity();
        self.typing.start_typing(channel);
    }

    pub fn stop_typing(&self, channel: ChannelId) {
        self.typing.stop_typing(channel);
    }

    /// Users currently typing in a channel.
    pub fn typing_users(&self, channel: &ChannelId) -> Vec<UserId> {
        self.typing.typing_users(channel)
    }

    /// Compares a local field map against server values, returning the
    /// genuinely conflicting fields after normalization.
    pub fn detect_conflicts(
        &self,
        model: &str,
        record_id: i64,
        local: &serde_json::Map<String, serde_json::Value>,
        server: &serde_json::Map<String, serde_json::Value>,
    ) -> Vec<record_merge::ConflictCandidate> {
        record_merge::diff_records(model, record_id, local, server)
    }

    /// Unparks reconnection after the user re-authenticated.
    pub fn notify_credentials_updated(&self) {
        self.session.notify_credentials_updated();
    }

    /// Terminal shutdown of every component.
    pub fn shutdown(&self) {
        self.session.shutdown();
        self.replayer.shutdown();
        self.presence.shutdown();
        self.typing.shutdown();
        if let Some(handle) = self.routing.lock().expect("lock poisoned").take() {
            handle.abort();
        }
    }
}

async fn route_events(
    mut session_events: broadcast::Receiver<SessionEvent>,
    mut outbox_events: broadcast::Receiver<OutboxEvent>,
    mut presence_events: broadcast::Receiver<PresenceEvent>,
    mut typing_events: broadcast::Receiver<TypingEvent>,
    presence: PresenceTracker,
    typing: TypingCoordinator,
    events: broadcast::Sender<SyncEvent>,
) {
    loop {
        tokio::select! {
            event = session_events.recv() => match event {
                Ok(SessionEvent::StateChanged(state)) => {
                    if state == ConnectionState::Disconnected {
                        // Remote indicators are meaningless without a feed,
                        // and our own will have expired server-side.
                        typing.clear_all();
                    }
                    let _ = events.send(SyncEvent::ConnectionStateChanged(state));
                }
                Ok(SessionEvent::Notification { channel, kind }) => {
                    route_notification(&presence, &typing, &events, channel, kind);
                }
                Ok(SessionEvent::AuthRequired { reason }) => {
                    let _ = events.send(SyncEvent::AuthRequired { reason });
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Session event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
            event = outbox_events.recv() => match event {
                Ok(OutboxEvent::Delivered { local_id, server_id, .. }) => {
                    let _ = events.send(SyncEvent::OutboxAcknowledged { local_id, server_id });
                }
                Ok(OutboxEvent::Failed { local_id, error, .. }) => {
                    let _ = events.send(SyncEvent::OutboxFailed { local_id, error });
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Outbox event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
            event = presence_events.recv() => match event {
                Ok(PresenceEvent::Changed { user_id, record }) => {
                    let _ = events.send(SyncEvent::PresenceChanged { user_id, record });
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Presence event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
            event = typing_events.recv() => match event {
                Ok(TypingEvent::Changed { channel, users }) => {
                    let _ = events.send(SyncEvent::TypingChanged { channel, users });
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Typing event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

fn route_notification(
    presence: &PresenceTracker,
    typing: &TypingCoordinator,
    events: &broadcast::Sender<SyncEvent>,
    channel: ChannelId,
    kind: NotificationKind,
) {
    match kind {
        NotificationKind::Message(message) => {
            let _ = events.send(SyncEvent::Message { channel, message });
        }
        NotificationKind::Presence(payload) => presence.apply_push(payload),
        NotificationKind::Typing(payload) => typing.apply_observed(channel, payload),
        NotificationKind::RecordChanged(payload) => {
            let _ = events.send(SyncEvent::RecordChanged {
                model: payload.model,
                record_id: payload.record_id,
                fields: payload.fields,
            });
        }
        // Acks are resolved inside the session; unknown kinds are dropped
        // by the sequencer. Neither should reach this point.
        NotificationKind::OperationAck(_) | NotificationKind::Unknown { .. } => {
            debug!("Ignoring notification kind the session should have consumed");
        }
    }
}
