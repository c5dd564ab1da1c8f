//! Offline-first sync and reconciliation engine.
//!
//! Feature code registers resources with a [`SyncCoordinator`], hydrates them
//! cache-first, and applies user actions optimistically through a
//! [`ReconciliationConsumer`]. Writes that cannot reach the remote are kept in
//! a durable mutation queue and replayed through per-channel handlers once
//! connectivity returns.

pub mod cache;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod error;
pub mod handler;
pub mod logging;
pub mod notifications;
pub mod observer;
pub mod queue;
pub mod resource;
pub mod retry;
pub mod status;
pub mod store;

pub use cache::{CacheRecord, ResourceCache};
pub use config::SyncConfig;
pub use consumer::{
    ApplyOutcome, Identified, ItemSyncState, OptimisticAction, ReconciliationConsumer,
    RemoteCommit,
};
pub use coordinator::{DrainMode, DrainReport, SyncCoordinator};
pub use error::{Result, RetryableError, SyncError};
pub use handler::{handler_fn, MutationHandler};
pub use notifications::{Notification, NotificationAction, NotificationCenter};
pub use observer::Subscription;
pub use queue::{MutationId, MutationRequest, QueuedMutation};
pub use resource::{HydrateOptions, HydratedResource, ResourceHandle, ResourceRegistration, Source};
pub use retry::RetryPolicy;
pub use status::SyncStatus;
pub use store::{DuckDbRecordStore, MemoryRecordStore, RecordStore, StoredRecord};
