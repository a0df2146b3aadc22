//! Notification sequencer.
//!
//! The stored cursor is always the maximum notification id seen. On
//! resubscribe the cursor is sent as `last` so the server replays only
//! what was missed; together with the dedup here this is what makes
//! delivery at-least-once-from-the-server, at-most-once-downstream.
//! Duplicates are filtered here and never left to downstream handlers,
//! which may have different idempotency needs.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use sync_core::{BusNotification, ChannelId, NotificationKind, StateStore};
use tracing::{debug, warn};

/// Cursor value meaning "nothing processed yet".
pub const CURSOR_NONE: i64 = 0;

/// Orders and deduplicates incoming notification batches.
pub struct NotificationSequencer {
    cursor: Arc<AtomicI64>,
    store: Arc<dyn StateStore>,
}

impl NotificationSequencer {
    /// Creates a sequencer, restoring the persisted cursor if present.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        let initial = match store.load_cursor() {
            Ok(cursor) => cursor.unwrap_or(CURSOR_NONE),
            Err(e) => {
                warn!(error = %e, "Failed to load persisted cursor, starting fresh");
                CURSOR_NONE
            }
        };
        Self {
            cursor: Arc::new(AtomicI64::new(initial)),
            store,
        }
    }

    /// Shared view of the cursor for frame builders.
    pub fn cursor_handle(&self) -> Arc<AtomicI64> {
        self.cursor.clone()
    }

    /// The highest notification id processed so far.
    pub fn cursor(&self) -> i64 {
        self.cursor.load(Ordering::SeqCst)
    }

    /// Ingests one batch: drops ids at or below the cursor, advances the
    /// cursor to the batch maximum, persists it, and decodes the
    /// survivors. Unknown kinds and malformed payloads are logged and
    /// dropped, never fatal.
    pub fn ingest(&self, batch: Vec<BusNotification>) -> Vec<(ChannelId, NotificationKind)> {
        let mut decoded = Vec::with_capacity(batch.len());
        let mut advanced = false;

        for notification in batch {
            let cursor = self.cursor.load(Ordering::SeqCst);
            if notification.id <= cursor {
                debug!(
                    id = notification.id,
                    cursor = cursor,
                    "Dropping duplicate notification"
                );
                continue;
            }
            self.cursor.store(notification.id, Ordering::SeqCst);
            advanced = true;

            match notification.decode() {
                Ok(NotificationKind::Unknown { kind }) => {
                    warn!(kind = %kind, id = notification.id, "Unknown notification kind, dropping");
                }
                Ok(kind) => decoded.push((notification.channel, kind)),
                Err(e) => {
                    warn!(
                        kind = %notification.kind,
                        id = notification.id,
                        error = %e,
                        "Malformed notification payload, dropping"
                    );
                }
            }
        }

        if advanced {
            let cursor = self.cursor.load(Ordering::SeqCst);
            if let Err(e) = self.store.save_cursor(cursor) {
                warn!(cursor = cursor, error = %e, "Failed to persist cursor");
            }
        }

        decoded
    }
}
