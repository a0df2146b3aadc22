//! Session error types.

use thiserror::Error;

/// Session error type.
#[derive(Error, Debug)]
pub enum SessionError {
    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication error
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Not connected
    #[error("Not connected to the bus")]
    NotConnected,

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Send error
    #[error("Failed to send frame: {0}")]
    Send(String),

    /// The session was shut down while the operation was pending.
    #[error("Session closed")]
    Closed,
}

/// Result type alias using SessionError.
pub type SessionResult<T> = Result<T, SessionError>;
