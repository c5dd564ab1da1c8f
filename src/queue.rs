//! Durable, ordered queue of pending write intents.
//!
//! Every queued mutation is its own record in the [`RecordStore`], keyed by
//! mutation id and tagged [`QUEUE_TAG`], so appends and removals touch a single
//! record. Order is `(enqueued_at, sequence)`.

use crate::error::RetryableError;
use crate::store::{RecordStore, StoredRecord};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::{NoContext, Timestamp, Uuid};

/// Tag carried by every persisted queue entry.
pub const QUEUE_TAG: &str = "sync:mutation-queue";

const QUEUE_KEY_PREFIX: &str = "sync/mutations/";

pub type MutationId = Uuid;

/// A write intent awaiting delivery to the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMutation {
    pub id: MutationId,
    pub channel: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub enqueued_at: DateTime<Utc>,
    /// Failed replay count
    #[serde(default)]
    pub attempts: u32,
    /// Tiebreaker for entries enqueued in the same instant
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl QueuedMutation {
    pub(crate) fn from_request(request: MutationRequest, sequence: u64) -> Self {
        Self {
            id: Uuid::new_v7(Timestamp::now(NoContext)),
            channel: request.channel,
            payload: request.payload,
            metadata: request.metadata,
            enqueued_at: Utc::now(),
            attempts: 0,
            sequence,
            last_attempt_at: None,
            last_error: None,
        }
    }

    /// Decode the payload into the feature's own action type.
    pub fn decode_payload<P: serde::de::DeserializeOwned>(&self) -> serde_json::Result<P> {
        serde_json::from_value(self.payload.clone())
    }

    fn storage_key(&self) -> String {
        storage_key(&self.id)
    }

    fn ordering(&self) -> (DateTime<Utc>, u64) {
        (self.enqueued_at, self.sequence)
    }
}

fn storage_key(id: &MutationId) -> String {
    format!("{}{}", QUEUE_KEY_PREFIX, id)
}

/// What a feature hands to `queue_mutation`.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRequest {
    pub channel: String,
    pub payload: serde_json::Value,
    pub metadata: BTreeMap<String, String>,
}

impl MutationRequest {
    pub fn new(channel: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            channel: channel.into(),
            payload,
            metadata: BTreeMap::new(),
        }
    }

    /// Build a request from any serializable action.
    pub fn encode<P: Serialize>(channel: impl Into<String>, payload: &P) -> serde_json::Result<Self> {
        Ok(Self::new(channel, serde_json::to_value(payload)?))
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

pub struct MutationQueue {
    store: Arc<dyn RecordStore>,
    entries: Vec<QueuedMutation>,
    next_sequence: u64,
}

impl MutationQueue {
    /// Rebuild the queue from every persisted entry.
    ///
    /// Entries that no longer decode are logged and left in the store
    /// untouched.
    pub async fn load(store: Arc<dyn RecordStore>) -> Result<Self> {
        let keys = store
            .keys_with_tag(QUEUE_TAG)
            .await
            .context("Failed to list queued mutations")?;

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(record) = store
                .get(&key)
                .await
                .with_context(|| format!("Failed to read queued mutation '{}'", key))?
            else {
                continue;
            };
            match serde_json::from_value::<QueuedMutation>(record.data) {
                Ok(mutation) => entries.push(mutation),
                Err(e) => error!("Skipping undecodable queued mutation '{}': {}", key, e),
            }
        }

        entries.sort_by_key(QueuedMutation::ordering);
        let next_sequence = entries.iter().map(|m| m.sequence + 1).max().unwrap_or(0);

        if !entries.is_empty() {
            debug!("Restored {} queued mutation(s)", entries.len());
        }

        Ok(Self {
            store,
            entries,
            next_sequence,
        })
    }

    /// Append a mutation and persist it.
    ///
    /// A failed write is logged and the entry is still kept in memory, so the
    /// current process will keep retrying it.
    pub async fn push(&mut self, request: MutationRequest) -> QueuedMutation {
        let mut mutation = QueuedMutation::from_request(request, self.next_sequence);
        while self.position(&mutation.id).is_some() {
            mutation.id = Uuid::new_v4();
        }
        // A wall clock stepping backwards must not put this ahead of the tail.
        if let Some(tail) = self.entries.last() {
            mutation.enqueued_at = mutation.enqueued_at.max(tail.enqueued_at);
        }
        self.next_sequence += 1;

        self.persist(&mutation).await;

        let index = self
            .entries
            .partition_point(|existing| existing.ordering() <= mutation.ordering());
        self.entries.insert(index, mutation.clone());
        mutation
    }

    /// Drop a delivered mutation.
    pub async fn remove(&mut self, id: &MutationId) -> Option<QueuedMutation> {
        let index = self.position(id)?;
        let mutation = self.entries.remove(index);
        if let Err(e) = self.store.remove(&mutation.storage_key()).await {
            error!(
                "Failed to remove delivered mutation {} from the store: {:#}",
                id, e
            );
        }
        Some(mutation)
    }

    /// Record a failed replay. The entry keeps its position.
    pub async fn record_failure(
        &mut self,
        id: &MutationId,
        error: &RetryableError,
        at: DateTime<Utc>,
    ) -> Option<u32> {
        let index = self.position(id)?;
        let mutation = &mut self.entries[index];
        mutation.attempts += 1;
        mutation.last_attempt_at = Some(at);
        mutation.last_error = Some(error.message().to_string());
        let snapshot = mutation.clone();

        self.persist(&snapshot).await;
        Some(snapshot.attempts)
    }

    pub fn get(&self, id: &MutationId) -> Option<&QueuedMutation> {
        self.position(id).map(|index| &self.entries[index])
    }

    /// All entries, oldest first.
    pub fn snapshot(&self) -> Vec<QueuedMutation> {
        self.entries.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedMutation> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, id: &MutationId) -> Option<usize> {
        self.entries.iter().position(|m| &m.id == id)
    }

    async fn persist(&self, mutation: &QueuedMutation) {
        let data = match serde_json::to_value(mutation) {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to encode queued mutation {}: {}", mutation.id, e);
                return;
            }
        };
        let tags = BTreeSet::from([QUEUE_TAG.to_string()]);
        let record = StoredRecord::new(data, Utc::now(), tags);

        if let Err(e) = self.store.put(&mutation.storage_key(), record).await {
            warn!(
                "Queued mutation {} on '{}' is held in memory only: {:#}",
                mutation.id, mutation.channel, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::BrokenStore;
    use crate::store::MemoryRecordStore;
    use serde_json::json;

    async fn empty_queue() -> (MutationQueue, Arc<MemoryRecordStore>) {
        let store = Arc::new(MemoryRecordStore::new());
        let queue = MutationQueue::load(store.clone()).await.unwrap();
        (queue, store)
    }

    #[tokio::test]
    async fn test_push_persists_each_entry_by_id() {
        let (mut queue, store) = empty_queue().await;

        let first = queue
            .push(MutationRequest::new("notification-center", json!({"type": "markRead", "id": "n-1"})))
            .await;
        let second = queue
            .push(
                MutationRequest::new("procurement", json!({"type": "approve", "id": "po-7"}))
                    .with_metadata("origin", "dashboard"),
            )
            .await;

        assert_eq!(queue.len(), 2);
        assert_ne!(first.id, second.id);
        assert_eq!(second.metadata["origin"], "dashboard");

        let keys = store.keys_with_tag(QUEUE_TAG).await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&storage_key(&first.id)));
    }

    #[tokio::test]
    async fn test_load_restores_fifo_order() {
        let (mut queue, store) = empty_queue().await;
        let mut ids = Vec::new();
        for i in 0..5 {
            let m = queue
                .push(MutationRequest::new("alerts", json!({"seq": i})))
                .await;
            ids.push(m.id);
        }

        let restored = MutationQueue::load(store).await.unwrap();
        let restored_ids: Vec<_> = restored.iter().map(|m| m.id).collect();

        assert_eq!(restored_ids, ids);
        assert_eq!(restored.next_sequence, 5);
    }

    #[tokio::test]
    async fn test_push_stays_behind_tail_when_clock_steps_back() {
        let (mut queue, store) = empty_queue().await;
        let first = queue.push(MutationRequest::new("alerts", json!(1))).await;
        // Tail stamped ahead of the current wall clock.
        let ahead = Utc::now() + chrono::Duration::minutes(10);
        queue.entries[0].enqueued_at = ahead;
        queue.persist(&queue.entries[0].clone()).await;

        let second = queue.push(MutationRequest::new("alerts", json!(2))).await;

        assert_eq!(second.enqueued_at, ahead);
        let order: Vec<_> = queue.iter().map(|m| m.id).collect();
        assert_eq!(order, vec![first.id, second.id]);

        let restored = MutationQueue::load(store).await.unwrap();
        let restored_order: Vec<_> = restored.iter().map(|m| m.id).collect();
        assert_eq!(restored_order, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn test_record_failure_keeps_position_and_counts() {
        let (mut queue, store) = empty_queue().await;
        let first = queue.push(MutationRequest::new("alerts", json!(1))).await;
        let second = queue.push(MutationRequest::new("alerts", json!(2))).await;

        let at = Utc::now();
        let err = RetryableError::new("503 from remote");
        assert_eq!(queue.record_failure(&first.id, &err, at).await, Some(1));
        assert_eq!(queue.record_failure(&first.id, &err, at).await, Some(2));

        let order: Vec<_> = queue.iter().map(|m| m.id).collect();
        assert_eq!(order, vec![first.id, second.id]);

        let restored = MutationQueue::load(store).await.unwrap();
        let entry = restored.get(&first.id).unwrap();
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.last_attempt_at, Some(at));
        assert_eq!(entry.last_error.as_deref(), Some("503 from remote"));
    }

    #[tokio::test]
    async fn test_remove_deletes_persisted_entry() {
        let (mut queue, store) = empty_queue().await;
        let m = queue.push(MutationRequest::new("alerts", json!(1))).await;

        assert!(queue.remove(&m.id).await.is_some());
        assert!(queue.remove(&m.id).await.is_none());
        assert!(queue.is_empty());
        assert!(store.keys_with_tag(QUEUE_TAG).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_entries_are_skipped() {
        let store = Arc::new(MemoryRecordStore::new());
        store
            .put(
                "sync/mutations/garbage",
                StoredRecord::new(
                    json!({"unexpected": true}),
                    Utc::now(),
                    BTreeSet::from([QUEUE_TAG.to_string()]),
                ),
            )
            .await
            .unwrap();

        let queue = MutationQueue::load(store).await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_push_survives_store_failure_in_memory() {
        let mut queue = MutationQueue {
            store: Arc::new(BrokenStore),
            entries: Vec::new(),
            next_sequence: 0,
        };

        queue.push(MutationRequest::new("alerts", json!(1))).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_load_fails_when_store_is_unreadable() {
        assert!(MutationQueue::load(Arc::new(BrokenStore)).await.is_err());
    }

    #[test]
    fn test_decode_payload() {
        #[derive(Deserialize, Debug, PartialEq)]
        struct Ack {
            id: String,
        }

        let request = MutationRequest::encode("alerts", &json!({"id": "a-1"})).unwrap();
        let mutation = QueuedMutation::from_request(request, 0);
        let ack: Ack = mutation.decode_payload().unwrap();
        assert_eq!(ack.id, "a-1");
    }
}
