//! Scripted doubles for whole-client tests.

use crate::client::SyncClient;
use crate::config::SyncClientConfig;
use async_trait::async_trait;
use bus_session::transport::{BusTransport, FrameSink, FrameStream, TransportFrame};
use bus_session::{AuthProvider, Credentials, SessionConfig, SessionError, SessionResult};
use presence_tracker::{PresenceResult, PresenceSource};
use serde_json::json;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sync_core::{MemoryStateStore, PresencePayload, PresenceStatus, SyncEvent, UserId};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use url::Url;

/// One accepted connection, driven from the server side by the test.
pub struct ConnectionHandle {
    sent: mpsc::UnboundedReceiver<String>,
    incoming: Option<mpsc::UnboundedSender<SessionResult<TransportFrame>>>,
    /// Server-assigned notification ids, shared across reconnects.
    next_id: Arc<AtomicI64>,
}

impl ConnectionHandle {
    /// Pushes one notification with the next server id.
    pub fn push_notification(&self, channel: &str, kind: &str, payload: serde_json::Value) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let frame = json!({
            "type": "notifications",
            "notifications": [{
                "id": id,
                "channel": channel,
                "kind": kind,
                "payload": payload,
            }],
        });
        if let Some(incoming) = &self.incoming {
            let _ = incoming.send(Ok(TransportFrame::Text(frame.to_string())));
        }
    }

    pub fn sever(&mut self) {
        self.incoming = None;
    }

    /// Next outbound frame, skipping heartbeat pings.
    pub async fn sent_frame(&mut self) -> serde_json::Value {
        loop {
            let text = timeout(Duration::from_secs(60), self.sent.recv())
                .await
                .expect("timed out waiting for an outbound frame")
                .expect("connection dropped before a frame was sent");
            let value: serde_json::Value =
                serde_json::from_str(&text).expect("outbound frame is not JSON");
            if value["type"] != "ping" {
                return value;
            }
        }
    }

    /// Awaits an operation frame and acknowledges it with `server_id`.
    pub async fn ack_next_operation(&mut self, server_id: i64) -> serde_json::Value {
        loop {
            let frame = self.sent_frame().await;
            if frame["type"] == "operation" {
                self.push_notification(
                    frame["channel"].as_str().expect("operation has a channel"),
                    "ack",
                    json!({ "local_id": frame["local_id"], "server_id": server_id }),
                );
                return frame;
            }
        }
    }
}

pub struct MockTransport {
    handles: Mutex<mpsc::UnboundedSender<ConnectionHandle>>,
    next_id: Arc<AtomicI64>,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionHandle>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                handles: Mutex::new(tx),
                next_id: Arc::new(AtomicI64::new(0)),
            }),
            rx,
        )
    }
}

#[async_trait]
impl BusTransport for MockTransport {
    async fn connect(
        &self,
        _url: &Url,
        _credentials: &Credentials,
    ) -> SessionResult<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let _ = self
            .handles
            .lock()
            .expect("lock poisoned")
            .send(ConnectionHandle {
                sent: sent_rx,
                incoming: Some(incoming_tx),
                next_id: self.next_id.clone(),
            });
        Ok((
            Box::new(MockSink { sender: sent_tx }),
            Box::new(MockStream {
                receiver: incoming_rx,
            }),
        ))
    }
}

struct MockSink {
    sender: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send(&mut self, text: String) -> SessionResult<()> {
        self.sender
            .send(text)
            .map_err(|_| SessionError::Send("mock connection closed".to_string()))
    }

    async fn close(&mut self) -> SessionResult<()> {
        Ok(())
    }
}

struct MockStream {
    receiver: mpsc::UnboundedReceiver<SessionResult<TransportFrame>>,
}

#[async_trait]
impl FrameStream for MockStream {
    async fn next(&mut self) -> Option<SessionResult<TransportFrame>> {
        self.receiver.recv().await
    }
}

struct StaticAuth;

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn credentials(&self) -> SessionResult<Credentials> {
        Ok(Credentials::bearer("test-token"))
    }

    async fn refresh(&self) -> SessionResult<Credentials> {
        Ok(Credentials::bearer("refreshed-token"))
    }
}

/// Presence source answering every lookup with "online".
struct OnlineSource;

#[async_trait]
impl PresenceSource for OnlineSource {
    async fn fetch(&self, users: &[UserId]) -> PresenceResult<Vec<PresencePayload>> {
        Ok(users
            .iter()
            .map(|user_id| PresencePayload {
                user_id: *user_id,
                status: PresenceStatus::Online,
                last_seen: None,
            })
            .collect())
    }
}

/// A client wired to scripted doubles with short, test-friendly timers.
pub struct ClientHarness {
    pub client: Arc<SyncClient>,
    pub store: Arc<MemoryStateStore>,
    connections: mpsc::UnboundedReceiver<ConnectionHandle>,
}

impl ClientHarness {
    pub fn new() -> Self {
        let (transport, connections) = MockTransport::new();
        let store = Arc::new(MemoryStateStore::new());
        let config = SyncClientConfig {
            session: SessionConfig {
                urls: vec![Url::parse("ws://bus.test/ws").expect("valid url")],
                connect_timeout: Duration::from_secs(1),
                backoff_initial: Duration::from_millis(100),
                backoff_max: Duration::from_secs(5),
                backoff_multiplier: 1.5,
                request_timeout: Duration::from_millis(500),
                heartbeat_interval: Duration::from_secs(3600),
            },
            ..SyncClientConfig::default()
        };
        let client = Arc::new(
            SyncClient::new(
                config,
                transport,
                Arc::new(StaticAuth),
                store.clone(),
                Arc::new(OnlineSource),
            )
            .expect("empty store recovers"),
        );
        Self {
            client,
            store,
            connections,
        }
    }

    /// Starts the client and awaits the first accepted connection.
    pub async fn start(&mut self) -> ConnectionHandle {
        self.client.start();
        self.next_connection().await
    }

    pub async fn next_connection(&mut self) -> ConnectionHandle {
        timeout(Duration::from_secs(60), self.connections.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("transport dropped")
    }
}

/// Awaits the next client event.
pub async fn next_event(events: &mut broadcast::Receiver<SyncEvent>) -> SyncEvent {
    timeout(Duration::from_secs(60), events.recv())
        .await
        .expect("timed out waiting for a client event")
        .expect("event channel closed")
}
