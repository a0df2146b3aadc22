//! Presence lookup collaborator.

use crate::error::{PresenceError, PresenceResult};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use sync_core::{PresencePayload, UserId};
use url::Url;

/// Answers batched presence lookups. The poll worker and debounced lookup
/// path both go through this; tests substitute a scripted implementation.
#[async_trait]
pub trait PresenceSource: Send + Sync {
    /// Fetches current presence for the given users. Users the server does
    /// not know may simply be absent from the response.
    async fn fetch(&self, users: &[UserId]) -> PresenceResult<Vec<PresencePayload>>;
}

/// HTTP implementation posting id batches to a presence endpoint.
pub struct HttpPresenceSource {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpPresenceSource {
    pub fn new(endpoint: Url) -> PresenceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl PresenceSource for HttpPresenceSource {
    async fn fetch(&self, users: &[UserId]) -> PresenceResult<Vec<PresencePayload>> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&json!({ "user_ids": users }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PresenceError::Status {
                status: status.as_u16(),
            });
        }

        response
            .json::<Vec<PresencePayload>>()
            .await
            .map_err(|e| PresenceError::Decode(e.to_string()))
    }
}
