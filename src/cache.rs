//! Resource cache accessor.
//!
//! Typed reads and writes of resource snapshots through a [`RecordStore`].
//! Storage failures never propagate from here: reads degrade to a miss and
//! writes are logged, so callers keep working from memory.

use crate::store::{RecordStore, StoredRecord};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// A typed cached snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRecord<T> {
    pub data: T,
    pub updated_at: DateTime<Utc>,
    pub tags: BTreeSet<String>,
}

#[derive(Clone)]
pub struct ResourceCache {
    store: Arc<dyn RecordStore>,
}

impl ResourceCache {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Read a typed record. Missing keys, store failures and records that no
    /// longer match `T` all come back as `None`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<CacheRecord<T>> {
        let record = self.get_raw(key).await?;
        match serde_json::from_value(record.data) {
            Ok(data) => Some(CacheRecord {
                data,
                updated_at: record.updated_at,
                tags: record.tags,
            }),
            Err(e) => {
                warn!("Cached record '{}' does not match its type: {}", key, e);
                None
            }
        }
    }

    pub async fn get_raw(&self, key: &str) -> Option<StoredRecord> {
        match self.store.get(key).await {
            Ok(record) => record,
            Err(e) => {
                warn!("Cache read for '{}' failed: {:#}", key, e);
                None
            }
        }
    }

    /// Write a snapshot stamped with the current time.
    ///
    /// The stamp never goes backwards for a key: if the stored record is
    /// already at or past `now`, the new one lands just after it. Returns the
    /// stamp used, whether or not the write reached the store.
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        data: &T,
        tags: BTreeSet<String>,
    ) -> DateTime<Utc> {
        let now = Utc::now();
        let value = match serde_json::to_value(data) {
            Ok(value) => value,
            Err(e) => {
                error!("Failed to encode snapshot for '{}': {}", key, e);
                return now;
            }
        };
        self.set_value(key, value, tags).await
    }

    pub async fn set_value(
        &self,
        key: &str,
        data: serde_json::Value,
        tags: BTreeSet<String>,
    ) -> DateTime<Utc> {
        let mut stamp = Utc::now();
        if let Some(previous) = self.get_raw(key).await {
            if previous.updated_at >= stamp {
                stamp = previous.updated_at + chrono::Duration::microseconds(1);
            }
        }
        self.write(key, StoredRecord::new(data, stamp, tags)).await;
        stamp
    }

    /// Write a snapshot with an explicit stamp, refusing stale writes.
    ///
    /// Returns `false` when the stored record is newer than `updated_at`.
    pub async fn set_at<T: Serialize>(
        &self,
        key: &str,
        data: &T,
        tags: BTreeSet<String>,
        updated_at: DateTime<Utc>,
    ) -> bool {
        if let Some(previous) = self.get_raw(key).await {
            if previous.updated_at > updated_at {
                debug!(
                    "Ignoring stale write to '{}' ({} < {})",
                    key, updated_at, previous.updated_at
                );
                return false;
            }
        }
        match serde_json::to_value(data) {
            Ok(value) => self.write(key, StoredRecord::new(value, updated_at, tags)).await,
            Err(e) => {
                error!("Failed to encode snapshot for '{}': {}", key, e);
                false
            }
        }
    }

    /// Fire-and-forget variant of [`ResourceCache::set`] for callers that must
    /// not wait on persistence. Failures are still logged.
    pub fn spawn_set<T: Serialize>(&self, key: &str, data: &T, tags: BTreeSet<String>) {
        let value = match serde_json::to_value(data) {
            Ok(value) => value,
            Err(e) => {
                error!("Failed to encode snapshot for '{}': {}", key, e);
                return;
            }
        };
        let cache = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            cache.set_value(&key, value, tags).await;
        });
    }

    pub async fn invalidate(&self, key: &str) -> bool {
        match self.store.remove(key).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Cache invalidation for '{}' failed: {:#}", key, e);
                false
            }
        }
    }

    pub async fn invalidate_tag(&self, tag: &str) -> Vec<String> {
        match self.store.invalidate_tag(tag).await {
            Ok(keys) => {
                debug!("Invalidated {} record(s) tagged '{}'", keys.len(), tag);
                keys
            }
            Err(e) => {
                warn!("Cache invalidation for tag '{}' failed: {:#}", tag, e);
                Vec::new()
            }
        }
    }

    async fn write(&self, key: &str, record: StoredRecord) -> bool {
        match self.store.put(key, record).await {
            Ok(()) => true,
            Err(e) => {
                error!("Cache write for '{}' failed: {:#}", key, e);
                false
            }
        }
    }
}
