//! Real-time sync client for an ERP messaging backend.
//!
//! Composes the bus session, offline outbox, presence tracker, typing
//! coordinator and conflict resolver behind one facade with a single
//! event stream. All collaborators (transport, auth, persistence, presence
//! lookups) are injected, so the whole client runs against doubles in
//! tests.

pub mod client;
pub mod config;
pub mod wiring;

#[cfg(test)]
mod tests;

pub use client::SyncClient;
pub use config::SyncClientConfig;
pub use wiring::{
    OutboxPresenceSink, OutboxTypingSink, SessionOperationTransport, OWN_PRESENCE_CHANNEL,
};

// The moving parts an embedding application needs by name.
pub use bus_session::{AuthProvider, BusTransport, Credentials, SessionConfig, WebSocketTransport};
pub use presence_tracker::{HttpPresenceSource, PresenceConfig, PresenceSource};
pub use record_merge::{values_equal, ConflictCandidate};
pub use sync_core::{
    BusNotification, ChannelId, ConnectionState, LocalId, MemoryStateStore, OperationKind,
    PresenceRecord, PresenceStatus, StateStore, SyncEvent, UserId,
};
pub use sync_outbox::OutboxConfig;
pub use typing_tracker::TypingConfig;
