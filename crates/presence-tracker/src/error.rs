//! Presence lookup errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PresenceError {
    /// HTTP transport failure talking to the presence endpoint.
    #[error("presence request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint answered with a non-success status.
    #[error("presence endpoint returned {status}")]
    Status { status: u16 },

    /// The response body did not match the expected shape.
    #[error("malformed presence response: {0}")]
    Decode(String),
}

pub type PresenceResult<T> = Result<T, PresenceError>;
