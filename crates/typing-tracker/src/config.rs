//! Typing coordinator tuning.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TypingConfig {
    /// Keystrokes within this window collapse into one start signal.
    pub start_debounce: Duration,
    /// Inactivity after which a stop signal is sent automatically.
    pub auto_stop: Duration,
    /// How long an observed indicator lives without a refresh. Kept at
    /// twice `auto_stop` so a healthy peer always refreshes in time.
    pub observed_expiry: Duration,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            start_debounce: Duration::from_secs(1),
            auto_stop: Duration::from_secs(3),
            observed_expiry: Duration::from_secs(6),
        }
    }
}
