//! Offline outbox: durable queue and replay for outbound operations.
//!
//! Operations enqueue synchronously regardless of connection state and are
//! replayed per-channel FIFO once connected, with bounded spaced retries.
//! Duplicate suppression relies on the client-generated local id traveling
//! with every attempt.

pub mod entry;
pub mod error;
pub mod queue;
pub mod replayer;

pub use entry::{retry_delay, OutboxEntry, OutboxStatus};
pub use error::{DeliveryError, OutboxError, OutboxResult};
pub use queue::{FailureOutcome, OutboxConfig, OutboxQueue};
pub use replayer::{OperationTransport, OutboxEvent, OutboxReplayer};
