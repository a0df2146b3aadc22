//! Bus session: the client side of the server-push notification bus.
//!
//! This crate provides:
//! - A reconnecting connection session with URL candidates, connect
//!   timeouts, close-reason classification and jittered exponential backoff
//! - A consumer-counted subscription registry resent in full on reconnect
//! - A cursor-based notification sequencer (dedup + ordering)
//! - Typed wire frames and a pluggable transport abstraction
//! - Request/ack correlation for outbound operations

pub mod auth;
pub mod backoff;
pub mod config;
pub mod error;
pub mod messages;
pub mod sequencer;
pub mod session;
pub mod subscriptions;
pub mod transport;

#[cfg(test)]
mod tests;

pub use auth::{AuthProvider, Credentials};
pub use backoff::Backoff;
pub use config::SessionConfig;
pub use error::{SessionError, SessionResult};
pub use messages::{ClientFrame, ClientFrameType, ServerFrame, ServerFrameType};
pub use sequencer::NotificationSequencer;
pub use session::{BusSession, RetryClass, SessionEvent};
pub use subscriptions::SubscriptionRegistry;
pub use transport::{BusTransport, FrameSink, FrameStream, TransportFrame, WebSocketTransport};
