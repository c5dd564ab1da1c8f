//! Persistent record store seam.
//!
//! The engine never talks to a database directly. It goes through
//! [`RecordStore`], a durable key to record map where each record carries its
//! last-updated time and a set of invalidation tags. Two backends ship with the
//! crate: [`MemoryRecordStore`] for tests and ephemeral sessions, and
//! [`DuckDbRecordStore`] for durable local state.

mod duckdb_store;
mod memory;

pub use self::duckdb_store::DuckDbRecordStore;
pub use self::memory::MemoryRecordStore;

use crate::config::{StoreBackend, StoreConfig};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// A stored value plus the metadata the store keeps for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub data: serde_json::Value,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl StoredRecord {
    pub fn new(data: serde_json::Value, updated_at: DateTime<Utc>, tags: BTreeSet<String>) -> Self {
        Self {
            data,
            updated_at,
            tags,
        }
    }
}

/// Durable key/value storage with per-record metadata.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch a record. A missing key is `Ok(None)`, not an error.
    async fn get(&self, key: &str) -> Result<Option<StoredRecord>>;

    /// Insert or replace a record.
    async fn put(&self, key: &str, record: StoredRecord) -> Result<()>;

    /// Remove a record, reporting whether it existed.
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Keys of every record carrying `tag`.
    async fn keys_with_tag(&self, tag: &str) -> Result<Vec<String>>;

    /// Remove every record carrying `tag`, returning the removed keys.
    async fn invalidate_tag(&self, tag: &str) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for key in self.keys_with_tag(tag).await? {
            if self.remove(&key).await? {
                removed.push(key);
            }
        }
        Ok(removed)
    }
}

/// Open the backend selected by `config`.
pub fn open_store(config: &StoreConfig) -> crate::error::Result<Arc<dyn RecordStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryRecordStore::new())),
        StoreBackend::Duckdb => {
            let path = config.database_path()?;
            Ok(Arc::new(DuckDbRecordStore::open(&path)?))
        }
    }
}
