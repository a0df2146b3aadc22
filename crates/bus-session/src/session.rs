//! Connection session with automatic reconnection.
//!
//! One session owns one transport connection at a time. Each attempt
//! builds the connected plumbing (writer task, heartbeat, pending-ack map
//! contents) from scratch and tears it down completely on close. State is
//! never reused across reconnects, which is what keeps stale handlers from
//! outliving the connection they belong to.

use crate::auth::AuthProvider;
use crate::backoff::Backoff;
use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::messages::{ClientFrame, ServerFrame, ServerFrameType};
use crate::sequencer::NotificationSequencer;
use crate::subscriptions::SubscriptionRegistry;
use crate::transport::{BusTransport, FrameSink, FrameStream, TransportFrame};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use sync_core::{
    ChannelId, ConnectionState, LocalId, NotificationKind, OperationKind, StateStore,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 100;
/// Capacity of the outbound frame queue while connected.
const OUTBOUND_QUEUE_CAPACITY: usize = 256;
/// How often inactive subscriptions are garbage-collected.
const REGISTRY_GC_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// Close code meaning the server-side session expired; credentials must be
/// refreshed before reconnecting.
pub const CLOSE_CODE_SESSION_EXPIRED: u16 = 4001;
/// Close code meaning the server dropped an idle connection; reconnect
/// immediately without backoff.
pub const CLOSE_CODE_IDLE_TIMEOUT: u16 = 4002;

/// What to do after a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Reconnect right away (idle-timeout class closes).
    Immediate,
    /// Reconnect after the current backoff delay.
    Backoff,
    /// Refresh credentials before the next attempt.
    RefreshCredentials,
    /// Clean, intentional shutdown. No retry.
    Terminal,
}

/// Classifies a close frame into a retry class.
pub fn classify_close(code: Option<u16>, reason: &str) -> RetryClass {
    match code {
        Some(CLOSE_CODE_SESSION_EXPIRED) => RetryClass::RefreshCredentials,
        Some(CLOSE_CODE_IDLE_TIMEOUT) => RetryClass::Immediate,
        _ => {
            let reason = reason.to_ascii_lowercase();
            if reason.contains("session") && reason.contains("expired") {
                RetryClass::RefreshCredentials
            } else if reason.contains("idle") {
                RetryClass::Immediate
            } else {
                RetryClass::Backoff
            }
        }
    }
}

/// Events emitted by the session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// A deduplicated, decoded notification (acks are resolved internally
    /// and never appear here).
    Notification {
        channel: ChannelId,
        kind: NotificationKind,
    },
    /// Credential refresh failed; no reconnect until new credentials.
    AuthRequired { reason: String },
}

struct Shared {
    config: SessionConfig,
    transport: Arc<dyn BusTransport>,
    auth: Arc<dyn AuthProvider>,
    registry: Mutex<SubscriptionRegistry>,
    cursor: Arc<AtomicI64>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    pending_acks: Mutex<HashMap<LocalId, oneshot::Sender<i64>>>,
    events: broadcast::Sender<SessionEvent>,
    state: watch::Sender<ConnectionState>,
    connected: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    resume: Notify,
    subs_changed: Notify,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            let _ = self.connected.send_replace(state.is_connected());
            let _ = self.events.send(SessionEvent::StateChanged(state));
        }
    }
}

/// Bus session handle. Cheap to share; all mutation happens on the owner
/// task spawned by [`BusSession::start`].
pub struct BusSession {
    shared: Arc<Shared>,
    sequencer: Mutex<Option<NotificationSequencer>>,
}

impl BusSession {
    /// Creates a session with injected collaborators. Call
    /// [`start`](Self::start) to begin connecting.
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn BusTransport>,
        auth: Arc<dyn AuthProvider>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (connected, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);

        let sequencer = NotificationSequencer::new(store);
        let cursor = sequencer.cursor_handle();

        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                auth,
                registry: Mutex::new(SubscriptionRegistry::new()),
                cursor,
                outbound: Mutex::new(None),
                pending_acks: Mutex::new(HashMap::new()),
                events,
                state,
                connected,
                shutdown,
                resume: Notify::new(),
                subs_changed: Notify::new(),
            }),
            sequencer: Mutex::new(Some(sequencer)),
        }
    }

    /// Starts the reconnect loop and the registry GC sweep.
    ///
    /// Panics if called more than once.
    pub fn start(&self) {
        let sequencer = self
            .sequencer
            .lock()
            .expect("lock poisoned")
            .take()
            .expect("BusSession already started");

        let shared = self.shared.clone();
        let shutdown = self.shared.shutdown.subscribe();
        tokio::spawn(run_loop(shared, sequencer, shutdown));

        let shared = self.shared.clone();
        let mut shutdown = self.shared.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(REGISTRY_GC_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let collected = shared
                            .registry
                            .lock()
                            .expect("lock poisoned")
                            .collect_garbage(chrono::Utc::now());
                        if collected > 0 {
                            debug!(collected, "Collected inactive subscriptions");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    /// Subscribes to session events.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch that flips to true while connected; the outbox replay worker
    /// uses its edges as a trigger.
    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    /// The highest notification id processed so far.
    pub fn cursor(&self) -> i64 {
        self.shared.cursor.load(Ordering::SeqCst)
    }

    /// Adds a consumer for a channel. Takes effect immediately if
    /// connected, otherwise on next connect. Returns true if the channel
    /// became active.
    pub fn subscribe(&self, channel: &ChannelId) -> bool {
        let became_active = self
            .shared
            .registry
            .lock()
            .expect("lock poisoned")
            .subscribe(channel);
        if became_active {
            self.resend_subscriptions();
        }
        became_active
    }

    /// Removes a consumer for a channel. Returns true if the channel
    /// became inactive (callers clear per-channel ephemeral state then).
    pub fn unsubscribe(&self, channel: &ChannelId) -> bool {
        let became_inactive = self
            .shared
            .registry
            .lock()
            .expect("lock poisoned")
            .unsubscribe(channel);
        if became_inactive {
            self.resend_subscriptions();
        }
        became_inactive
    }

    /// Snapshot of the active channel set.
    pub fn subscribed_channels(&self) -> Vec<ChannelId> {
        self.shared
            .registry
            .lock()
            .expect("lock poisoned")
            .active_channels()
    }

    /// Sends an operation and awaits its server ack, correlated by local
    /// id. Fails fast with [`SessionError::NotConnected`] when there is no
    /// live connection; the outbox owns queuing and retries.
    pub async fn deliver_operation(
        &self,
        kind: OperationKind,
        local_id: LocalId,
        channel: ChannelId,
        payload: serde_json::Value,
    ) -> SessionResult<i64> {
        let sender = self
            .shared
            .outbound
            .lock()
            .expect("lock poisoned")
            .clone()
            .ok_or(SessionError::NotConnected)?;

        let (ack_tx, ack_rx) = oneshot::channel();
        self.shared
            .pending_acks
            .lock()
            .expect("lock poisoned")
            .insert(local_id, ack_tx);

        let frame = ClientFrame::operation(kind, local_id, channel, payload).to_json()?;
        if sender.send(frame).await.is_err() {
            self.shared
                .pending_acks
                .lock()
                .expect("lock poisoned")
                .remove(&local_id);
            return Err(SessionError::NotConnected);
        }

        match timeout(self.shared.config.request_timeout, ack_rx).await {
            Ok(Ok(server_id)) => Ok(server_id),
            // The connection dropped and the pending map was cleared.
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_) => {
                self.shared
                    .pending_acks
                    .lock()
                    .expect("lock poisoned")
                    .remove(&local_id);
                Err(SessionError::Timeout)
            }
        }
    }

    /// Unparks the reconnect loop after the user re-authenticated.
    pub fn notify_credentials_updated(&self) {
        self.shared.resume.notify_one();
    }

    /// Clean, terminal shutdown. Cancels in-flight connect and backoff
    /// timers so no zombie reconnect races a fresh session.
    pub fn shutdown(&self) {
        let _ = self.shared.shutdown.send_replace(true);
        self.shared.resume.notify_one();
    }

    /// Nudges the connected loop to send the full desired set. The loop
    /// owns the awaited send, so back-to-back changes stay ordered and a
    /// burst coalesces into one frame carrying the latest set.
    fn resend_subscriptions(&self) {
        if *self.shared.connected.borrow() {
            self.shared.subs_changed.notify_one();
        }
    }
}

async fn run_loop(
    shared: Arc<Shared>,
    sequencer: NotificationSequencer,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(
        shared.config.backoff_initial,
        shared.config.backoff_max,
        shared.config.backoff_multiplier,
    );
    let mut first_attempt = true;

    loop {
        if *shutdown.borrow() {
            break;
        }
        shared.set_state(if first_attempt {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        });
        first_attempt = false;

        // Shutdown must also cancel an attempt that is still dialing.
        let attempt = tokio::select! {
            result = connect_once(&shared) => result,
            _ = shutdown.changed() => break,
        };
        match attempt {
            Ok((sink, stream)) => {
                backoff.reset();
                let class = run_connected(&shared, &sequencer, sink, stream, &mut shutdown).await;
                match class {
                    RetryClass::Terminal => break,
                    RetryClass::Immediate => continue,
                    RetryClass::RefreshCredentials => match shared.auth.refresh().await {
                        Ok(_) => {
                            info!("Credentials refreshed, reconnecting");
                            continue;
                        }
                        Err(e) => {
                            error!(error = %e, "Credential refresh failed");
                            let _ = shared.events.send(SessionEvent::AuthRequired {
                                reason: e.to_string(),
                            });
                            tokio::select! {
                                _ = shared.resume.notified() => continue,
                                _ = shutdown.changed() => break,
                            }
                        }
                    },
                    RetryClass::Backoff => {
                        let delay = backoff.next_delay();
                        debug!(delay_ms = delay.as_millis() as u64, "Reconnecting after backoff");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.changed() => break,
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Connect attempt failed");
                shared.set_state(ConnectionState::Disconnected);
                let delay = backoff.next_delay();
                debug!(delay_ms = delay.as_millis() as u64, "Retrying after backoff");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    shared.set_state(ConnectionState::Idle);
}

/// Tries every URL candidate in priority order before giving up on this
/// attempt. A connect timeout is treated identically to a transport error.
async fn connect_once(
    shared: &Arc<Shared>,
) -> SessionResult<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
    let credentials = shared.auth.credentials().await?;

    for url in &shared.config.urls {
        match timeout(
            shared.config.connect_timeout,
            shared.transport.connect(url, &credentials),
        )
        .await
        {
            Ok(Ok(pair)) => {
                info!(url = %url, "Connected to bus");
                return Ok(pair);
            }
            Ok(Err(e)) => warn!(url = %url, error = %e, "Endpoint failed"),
            Err(_) => warn!(url = %url, "Endpoint timed out"),
        }
    }

    Err(SessionError::Connection(
        "all endpoint candidates failed".to_string(),
    ))
}

async fn run_connected(
    shared: &Arc<Shared>,
    sequencer: &NotificationSequencer,
    mut sink: Box<dyn FrameSink>,
    mut stream: Box<dyn FrameStream>,
    shutdown: &mut watch::Receiver<bool>,
) -> RetryClass {
    let (sender, mut receiver) = mpsc::channel::<String>(OUTBOUND_QUEUE_CAPACITY);
    *shared.outbound.lock().expect("lock poisoned") = Some(sender.clone());

    let writer = tokio::spawn(async move {
        while let Some(text) = receiver.recv().await {
            if sink.send(text).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let heartbeat_sender = sender.clone();
    let heartbeat_interval = shared.config.heartbeat_interval;
    let heartbeat = tokio::spawn(async move {
        let mut ticker = interval(heartbeat_interval);
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            if let Ok(json) = ClientFrame::ping().to_json() {
                if heartbeat_sender.send(json).await.is_err() {
                    break;
                }
            }
        }
    });

    shared.set_state(ConnectionState::Connected);

    // The server has no memory of a torn-down session: resend the full
    // desired set with the last cursor so missed notifications replay.
    send_subscribe_frame(shared, &sender).await;

    let class = loop {
        tokio::select! {
            _ = shutdown.changed() => break RetryClass::Terminal,
            _ = shared.subs_changed.notified() => {
                send_subscribe_frame(shared, &sender).await;
            }
            frame = stream.next() => match frame {
                Some(Ok(TransportFrame::Text(text))) => {
                    handle_text_frame(shared, sequencer, &text);
                }
                Some(Ok(TransportFrame::Close { code, reason })) => {
                    let class = classify_close(code, &reason);
                    info!(code = ?code, reason = %reason, class = ?class, "Bus connection closed");
                    break class;
                }
                Some(Err(e)) => {
                    error!(error = %e, "Transport error");
                    break RetryClass::Backoff;
                }
                None => {
                    info!("Bus stream ended");
                    break RetryClass::Backoff;
                }
            }
        }
    };

    // Teardown: everything built for this connection dies with it.
    heartbeat.abort();
    *shared.outbound.lock().expect("lock poisoned") = None;
    drop(sender);
    writer.abort();
    shared.pending_acks.lock().expect("lock poisoned").clear();

    if class != RetryClass::Terminal {
        shared.set_state(ConnectionState::Disconnected);
    }
    class
}

/// Serializes and sends the full subscription set with the current cursor.
async fn send_subscribe_frame(shared: &Arc<Shared>, sender: &mpsc::Sender<String>) {
    let channels = shared
        .registry
        .lock()
        .expect("lock poisoned")
        .active_channels();
    let last = shared.cursor.load(Ordering::SeqCst);
    match ClientFrame::subscribe(channels, last).to_json() {
        Ok(json) => {
            if sender.send(json).await.is_err() {
                warn!("Failed to send subscribe frame");
            }
        }
        Err(e) => warn!(error = %e, "Failed to serialize subscribe frame"),
    }
}

fn handle_text_frame(shared: &Arc<Shared>, sequencer: &NotificationSequencer, text: &str) {
    let frame = match ServerFrame::from_json(text) {
        Ok(frame) => frame,
        Err(e) => {
            // Protocol error: drop the frame, keep the session.
            warn!(error = %e, "Malformed bus frame, dropping");
            return;
        }
    };

    match frame.frame_type {
        ServerFrameType::Notifications => {
            let batch = frame.notifications.unwrap_or_default();
            for (channel, kind) in sequencer.ingest(batch) {
                match kind {
                    NotificationKind::OperationAck(ack) => {
                        let pending = shared
                            .pending_acks
                            .lock()
                            .expect("lock poisoned")
                            .remove(&ack.local_id);
                        match pending {
                            Some(waiter) => {
                                let _ = waiter.send(ack.server_id);
                            }
                            None => debug!(
                                local_id = %ack.local_id,
                                server_id = ack.server_id,
                                "Ack without a waiting operation"
                            ),
                        }
                    }
                    kind => {
                        let _ = shared
                            .events
                            .send(SessionEvent::Notification { channel, kind });
                    }
                }
            }
        }
        ServerFrameType::Pong => {}
        ServerFrameType::Error => {
            warn!(error = ?frame.error, "Bus reported an error");
        }
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn close_classification() {
        assert_eq!(
            classify_close(Some(CLOSE_CODE_SESSION_EXPIRED), ""),
            RetryClass::RefreshCredentials
        );
        assert_eq!(
            classify_close(Some(CLOSE_CODE_IDLE_TIMEOUT), ""),
            RetryClass::Immediate
        );
        assert_eq!(
            classify_close(None, "Session Expired"),
            RetryClass::RefreshCredentials
        );
        assert_eq!(classify_close(None, "idle timeout"), RetryClass::Immediate);
        assert_eq!(classify_close(Some(1006), ""), RetryClass::Backoff);
        assert_eq!(classify_close(None, ""), RetryClass::Backoff);
    }
}

// Integration-style session tests live in crate::tests.
