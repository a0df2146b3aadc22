//! Credential collaborator.
//!
//! Token acquisition and refresh are owned by the embedding application;
//! the session only needs current credentials at connect time and a way to
//! request a refresh when the server closes with a session-expired reason.

use crate::error::SessionResult;
use async_trait::async_trait;

/// Connection-time credentials.
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    /// Bearer token sent as an `Authorization` header.
    pub bearer_token: Option<String>,
    /// Session cookie sent as a `Cookie` header.
    pub session_cookie: Option<String>,
}

impl Credentials {
    /// Creates bearer-token credentials.
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            bearer_token: Some(token.into()),
            session_cookie: None,
        }
    }
}

/// Supplies and refreshes credentials for the bus connection.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Returns the credentials to use for the next connect attempt.
    async fn credentials(&self) -> SessionResult<Credentials>;

    /// Refreshes expired credentials.
    ///
    /// Called after a session-expired close; the next connect attempt is
    /// not made until this completes. An error here is terminal until the
    /// user re-authenticates.
    async fn refresh(&self) -> SessionResult<Credentials>;
}
