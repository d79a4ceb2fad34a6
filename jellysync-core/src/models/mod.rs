pub mod event;
pub mod mapping;
pub mod webhook;

pub use event::{
    EventData, NewPendingEvent, NewSyncLogEntry, PendingEvent, PendingEventStatus, QueueCounts,
    SyncEventType, SyncLogEntry, SyncStats,
};
pub use mapping::{ItemPathCacheEntry, UserMapping};
pub use webhook::WebhookPayload;
