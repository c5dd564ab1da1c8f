use super::{RecordStore, StoredRecord};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-process record store. Nothing survives the process.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<String, StoredRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, key: &str) -> Result<Option<StoredRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, record: StoredRecord) -> Result<()> {
        self.records.write().await.insert(key.to_string(), record);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.records.write().await.remove(key).is_some())
    }

    async fn keys_with_tag(&self, tag: &str) -> Result<Vec<String>> {
        let records = self.records.read().await;
        let mut keys: Vec<String> = records
            .iter()
            .filter(|(_, record)| record.tags.contains(tag))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
