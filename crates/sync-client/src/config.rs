//! Top-level client configuration.

use bus_session::SessionConfig;
use presence_tracker::PresenceConfig;
use sync_outbox::OutboxConfig;
use typing_tracker::TypingConfig;
use url::Url;

/// Configuration for the whole sync client, one section per component.
#[derive(Debug, Clone, Default)]
pub struct SyncClientConfig {
    pub session: SessionConfig,
    pub outbox: OutboxConfig,
    pub presence: PresenceConfig,
    pub typing: TypingConfig,
}

impl SyncClientConfig {
    /// Defaults with a single bus endpoint.
    pub fn with_url(url: Url) -> Self {
        Self {
            session: SessionConfig::single_url(url),
            ..Self::default()
        }
    }
}
