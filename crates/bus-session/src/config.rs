//! Session configuration.

use std::time::Duration;
use url::Url;

/// Bus session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Endpoint candidates, tried in priority order within one attempt.
    pub urls: Vec<Url>,
    /// Timeout for a single connect attempt.
    pub connect_timeout: Duration,
    /// Initial (and floor) reconnect delay.
    pub backoff_initial: Duration,
    /// Maximum reconnect delay.
    pub backoff_max: Duration,
    /// Backoff growth factor per failed attempt.
    pub backoff_multiplier: f64,
    /// Timeout for an outbound operation awaiting its server ack.
    pub request_timeout: Duration,
    /// Heartbeat ping interval while connected.
    pub heartbeat_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            connect_timeout: Duration::from_secs(15),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            backoff_multiplier: 1.5,
            request_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl SessionConfig {
    /// Convenience constructor for a single endpoint.
    pub fn single_url(url: Url) -> Self {
        Self {
            urls: vec![url],
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_recommended_values() {
        let config = SessionConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(15));
        assert_eq!(config.backoff_initial, Duration::from_secs(1));
        assert_eq!(config.backoff_max, Duration::from_secs(60));
        assert_eq!(config.backoff_multiplier, 1.5);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn single_url_keeps_other_defaults() {
        let url = Url::parse("wss://bus.example.com/ws").unwrap();
        let config = SessionConfig::single_url(url.clone());
        assert_eq!(config.urls, vec![url]);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
    }
}
