//! Shared types for the messaging bus sync core.
//!
//! This crate provides:
//! - Identifier newtypes (`ChannelId`, `UserId`, `LocalId`)
//! - The decoded notification model (`BusNotification`, `NotificationKind`)
//! - The unified event stream type (`SyncEvent`)
//! - The external persistence collaborator (`StateStore`)
//! - A cancelable scheduled-task handle (`TaskHandle`)

mod events;
mod notification;
mod store;
mod task;
mod types;

pub use events::{PresenceOrigin, PresenceRecord, SyncEvent};
pub use notification::{
    BusNotification, MessagePayload, NotificationKind, OperationAckPayload, PresencePayload,
    RecordChangedPayload, TypingPayload,
};
pub use store::{MemoryStateStore, StateStore, StoreError, StoreResult};
pub use task::TaskHandle;
pub use types::{
    ChannelId, ConnectionState, LocalId, OperationKind, PresenceStatus, UserId,
};
