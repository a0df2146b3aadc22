//! Outbox error types.

use sync_core::StoreError;
use thiserror::Error;

/// Errors from queue and replay operations.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Persistence backend failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Entry serialization failed.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// No queued entry carries this local id.
    #[error("no queued entry with local id {0}")]
    NotFound(String),
}

/// Result type alias using OutboxError.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Delivery failure as reported by the transport.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// No live connection; replay resumes on the next connect.
    #[error("not connected")]
    NotConnected,

    /// The server acked nothing within the request window.
    #[error("ack timed out")]
    Timeout,

    /// The server or transport rejected the operation.
    #[error("delivery rejected: {0}")]
    Rejected(String),
}

impl DeliveryError {
    /// Connection-level failures pause the whole replay pass instead of
    /// burning an attempt on every queued entry.
    pub fn is_connection_level(&self) -> bool {
        matches!(self, DeliveryError::NotConnected)
    }
}
