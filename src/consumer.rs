//! Optimistic reconciliation of a collection of items.
//!
//! A [`ReconciliationConsumer`] owns the single in-memory copy of a feature's
//! collection. User actions are applied to it immediately, persisted to the
//! cache, then committed to the remote; a failed commit is queued on the
//! consumer's channel and replayed later. Optimistic state is never rolled
//! back.

use crate::coordinator::SyncCoordinator;
use crate::error::{Result, RetryableError};
use crate::handler::handler_fn;
use crate::observer::{lock, Subscription};
use crate::queue::{MutationId, MutationRequest, QueuedMutation};
use crate::resource::{HydrateOptions, HydratedResource, ResourceHandle, ResourceRegistration, Source};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

/// Items addressable by a stable id.
pub trait Identified {
    fn id(&self) -> &str;
}

/// A user action on one item.
///
/// Actions must be idempotent set-to-value operations so that replaying one
/// on top of a remote snapshot is always safe.
pub trait OptimisticAction<T>:
    Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
    fn target_id(&self) -> &str;

    /// Apply to `item`, returning whether anything changed.
    fn apply(&self, item: &mut T) -> bool;
}

/// Direct remote call for an action. `Err` means "not applied yet".
#[async_trait]
pub trait RemoteCommit<A>: Send + Sync {
    async fn commit(&self, action: &A) -> std::result::Result<(), RetryableError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemSyncState {
    Synced,
    OptimisticallyApplied,
    Queued,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The action did not change the item; nothing was committed or queued
    Unchanged,
    NotFound,
    /// The remote accepted the action directly
    Committed,
    /// The remote was unreachable; the action is queued for replay
    Queued(MutationId),
}

struct PendingAction<A> {
    token: u64,
    action: A,
    mutation_id: Option<MutationId>,
}

/// Stored form of an unsynced action, kept next to the collection so a
/// restarted consumer can keep re-applying it.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedAction<A> {
    action: A,
    #[serde(default)]
    mutation_id: Option<MutationId>,
}

struct ConsumerState<T, A> {
    items: Vec<T>,
    version: u64,
    loaded: bool,
    restored: bool,
    pending: Vec<PendingAction<A>>,
    item_states: HashMap<String, ItemSyncState>,
    settled_early: HashSet<MutationId>,
}

impl<T: Identified, A: OptimisticAction<T>> ConsumerState<T, A> {
    fn persisted_pending(&self) -> Vec<PersistedAction<A>> {
        self.pending
            .iter()
            .map(|p| PersistedAction {
                action: p.action.clone(),
                mutation_id: p.mutation_id,
            })
            .collect()
    }

    /// Record the queue id for an in-flight action, or settle it at once if
    /// the replay already beat us to it.
    fn attach_mutation(&mut self, token: u64, target: &str, id: MutationId) {
        if self.settled_early.remove(&id) {
            self.settle(target, |p| p.token == token);
            return;
        }
        let tracked = self
            .pending
            .iter_mut()
            .find(|p| p.token == token)
            .map(|pending| pending.mutation_id = Some(id))
            .is_some();
        if tracked {
            self.item_states
                .insert(target.to_string(), ItemSyncState::Queued);
        }
    }

    fn settle(&mut self, target: &str, matches: impl Fn(&PendingAction<A>) -> bool) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| !matches(p));
        if !self.pending.iter().any(|p| p.action.target_id() == target) {
            self.item_states.remove(target);
        }
        self.pending.len() != before
    }

    /// Replace the collection with a remote snapshot and re-apply every
    /// unsynced action on top. Returns whether re-applying changed anything.
    fn merge_remote(&mut self, mut items: Vec<T>) -> bool {
        let mut reapplied = false;
        for pending in &self.pending {
            if let Some(item) = items
                .iter_mut()
                .find(|item| item.id() == pending.action.target_id())
            {
                reapplied |= pending.action.apply(item);
            }
        }

        let targets: HashSet<&str> = self.pending.iter().map(|p| p.action.target_id()).collect();
        self.item_states.retain(|id, _| targets.contains(id.as_str()));
        self.items = items;
        self.version += 1;
        self.loaded = true;
        reapplied
    }
}

struct ConsumerInner<T, A> {
    coordinator: SyncCoordinator,
    resource: ResourceHandle<Vec<T>>,
    pending_key: String,
    channel: String,
    remote: Arc<dyn RemoteCommit<A>>,
    state: Mutex<ConsumerState<T, A>>,
    persist_lock: tokio::sync::Mutex<()>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl<T, A> ConsumerInner<T, A>
where
    T: Identified + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    A: OptimisticAction<T>,
{
    /// Write the current collection and its unsynced actions to the cache.
    /// Writes are serialized and always take the latest state, so a slow
    /// write never lands stale data.
    async fn persist_current(&self) -> Result<()> {
        let _ordered = self.persist_lock.lock().await;
        let (items, pending) = {
            let state = lock(&self.state);
            (state.items.clone(), state.persisted_pending())
        };
        self.resource.store(&items).await?;
        self.coordinator
            .cache()
            .set(&self.pending_key, &pending, BTreeSet::new())
            .await;
        Ok(())
    }

    async fn persist_pending(&self) {
        let _ordered = self.persist_lock.lock().await;
        let pending = lock(&self.state).persisted_pending();
        self.coordinator
            .cache()
            .set(&self.pending_key, &pending, BTreeSet::new())
            .await;
    }

    /// Bring back the unsynced actions a previous process left behind.
    /// Actions that never reached the queue are queued now.
    async fn restore_pending(&self) -> Result<()> {
        if lock(&self.state).restored {
            return Ok(());
        }
        let persisted = self
            .coordinator
            .cache()
            .get::<Vec<PersistedAction<A>>>(&self.pending_key)
            .await
            .map(|record| record.data)
            .unwrap_or_default();

        let (unqueued, reapplied) = {
            let mut state = lock(&self.state);
            if state.restored {
                return Ok(());
            }
            state.restored = true;

            let mut unqueued = Vec::new();
            let mut reapplied = false;
            for entry in persisted {
                state.version += 1;
                let token = state.version;
                let target = entry.action.target_id().to_string();
                if let Some(item) = state.items.iter_mut().find(|item| item.id() == target) {
                    reapplied |= entry.action.apply(item);
                }
                let sync_state = match entry.mutation_id {
                    Some(_) => ItemSyncState::Queued,
                    None => {
                        unqueued.push((token, entry.action.clone()));
                        ItemSyncState::OptimisticallyApplied
                    }
                };
                state.item_states.insert(target, sync_state);
                state.pending.push(PendingAction {
                    token,
                    action: entry.action,
                    mutation_id: entry.mutation_id,
                });
            }
            if !state.pending.is_empty() {
                debug!(
                    "Restored {} unsynced action(s) for '{}'",
                    state.pending.len(),
                    self.resource.key()
                );
            }
            (unqueued, reapplied)
        };

        for (token, action) in unqueued {
            self.enqueue(token, &action).await?;
        }
        if reapplied {
            self.persist_current().await?;
        }
        Ok(())
    }

    async fn enqueue(&self, token: u64, action: &A) -> Result<MutationId> {
        let target = action.target_id().to_string();
        let request = MutationRequest::encode(&self.channel, action)?
            .with_metadata("target", target.clone());
        let id = self.coordinator.queue_mutation(request).await?;

        lock(&self.state).attach_mutation(token, &target, id);
        self.persist_pending().await;
        Ok(id)
    }

    fn on_remote_snapshot(self: &Arc<Self>, snapshot: &HydratedResource<Vec<T>>) {
        let reapplied = lock(&self.state).merge_remote(snapshot.data.clone());
        if reapplied {
            debug!("Re-applied unsynced actions on top of remote '{}'", self.resource.key());
            let inner = self.clone();
            tokio::spawn(async move {
                if let Err(e) = inner.persist_current().await {
                    warn!("Failed to persist merged '{}': {}", inner.resource.key(), e);
                }
            });
        }
    }

    async fn replay(&self, mutation: &QueuedMutation) -> std::result::Result<(), RetryableError> {
        let action: A = mutation.decode_payload().map_err(|e| {
            RetryableError::new(format!("undecodable action on '{}': {}", self.channel, e))
        })?;
        self.remote.commit(&action).await?;

        let id = mutation.id;
        let target = action.target_id();
        let settled = {
            let mut state = lock(&self.state);
            let settled = state.settle(target, |p| p.mutation_id == Some(id));
            // Only an apply still waiting on its queue id can claim this later.
            let awaiting_id = state
                .pending
                .iter()
                .any(|p| p.mutation_id.is_none() && p.action.target_id() == target);
            if !settled && awaiting_id {
                state.settled_early.insert(id);
            }
            settled
        };
        if settled {
            self.persist_pending().await;
        }
        Ok(())
    }
}

impl<T, A> Drop for ConsumerInner<T, A> {
    fn drop(&mut self) {
        for subscription in lock(&self.subscriptions).drain(..) {
            subscription.unsubscribe();
        }
    }
}

/// Optimistic front for one resource collection and its mutation channel.
pub struct ReconciliationConsumer<T, A> {
    inner: Arc<ConsumerInner<T, A>>,
}

impl<T, A> Clone for ReconciliationConsumer<T, A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, A> ReconciliationConsumer<T, A>
where
    T: Identified + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    A: OptimisticAction<T>,
{
    /// Register the collection resource and the replay handler for `channel`.
    pub fn new(
        coordinator: &SyncCoordinator,
        registration: ResourceRegistration<Vec<T>>,
        channel: impl Into<String>,
        remote: Arc<dyn RemoteCommit<A>>,
    ) -> Result<Self> {
        let mut registration = registration;
        // Hydrated below, once the snapshot listener is attached.
        let hydrate_now = std::mem::replace(&mut registration.hydrate_on_register, false);
        let resource = coordinator.register_resource(registration)?;
        let inner = Arc::new(ConsumerInner {
            coordinator: coordinator.clone(),
            pending_key: format!("{}/pending", resource.key()),
            resource,
            channel: channel.into(),
            remote,
            state: Mutex::new(ConsumerState {
                items: Vec::new(),
                version: 0,
                loaded: false,
                restored: false,
                pending: Vec::new(),
                item_states: HashMap::new(),
                settled_early: HashSet::new(),
            }),
            persist_lock: tokio::sync::Mutex::new(()),
            subscriptions: Mutex::new(Vec::new()),
        });

        let weak: Weak<ConsumerInner<T, A>> = Arc::downgrade(&inner);
        let snapshots = inner.resource.subscribe({
            let weak = weak.clone();
            move |snapshot| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_remote_snapshot(snapshot);
                }
            }
        });

        let handler = coordinator.register_mutation_handler(
            inner.channel.clone(),
            handler_fn(move |mutation: QueuedMutation| {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return Err(RetryableError::new("consumer is gone"));
                    };
                    inner.replay(&mutation).await
                }
            }),
        )?;

        lock(&inner.subscriptions).extend([snapshots, handler]);
        let consumer = Self { inner };

        if hydrate_now {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let initial = consumer.clone();
                    runtime.spawn(async move {
                        if let Err(e) = initial.load(HydrateOptions::default()).await {
                            warn!("Initial load of '{}' failed: {}", initial.channel(), e);
                        }
                    });
                }
                Err(_) => warn!(
                    "No async runtime available; skipping initial load of '{}'",
                    consumer.channel()
                ),
            }
        }
        Ok(consumer)
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    pub fn resource(&self) -> &ResourceHandle<Vec<T>> {
        &self.inner.resource
    }

    /// Hydrate the collection. Remote snapshots are merged with unsynced
    /// actions, including those restored from a previous process; a cached
    /// snapshot is only adopted before anything else has been loaded.
    pub async fn load(&self, options: HydrateOptions) -> Result<Vec<T>> {
        self.inner.restore_pending().await?;
        let hydrated = self.inner.resource.hydrate(options).await?;
        if hydrated.source == Source::Cache {
            let mut state = lock(&self.inner.state);
            if !state.loaded {
                state.merge_remote(hydrated.data);
            }
        }
        Ok(self.items())
    }

    /// Apply `action` locally, persist it, then try the remote. A failed or
    /// impossible remote call queues the action instead of undoing it.
    pub async fn apply(&self, action: A) -> Result<ApplyOutcome> {
        self.inner.coordinator.ensure_active()?;
        let target = action.target_id().to_string();

        let token = {
            let mut state = lock(&self.inner.state);
            let Some(item) = state.items.iter_mut().find(|item| item.id() == target) else {
                return Ok(ApplyOutcome::NotFound);
            };
            if !action.apply(item) {
                return Ok(ApplyOutcome::Unchanged);
            }
            state.version += 1;
            let token = state.version;
            state.pending.push(PendingAction {
                token,
                action: action.clone(),
                mutation_id: None,
            });
            state
                .item_states
                .insert(target.clone(), ItemSyncState::OptimisticallyApplied);
            token
        };

        self.inner.persist_current().await?;

        if self.inner.coordinator.is_online() {
            match self.inner.remote.commit(&action).await {
                Ok(()) => {
                    lock(&self.inner.state).settle(&target, |p| p.token == token);
                    self.inner.persist_pending().await;
                    return Ok(ApplyOutcome::Committed);
                }
                Err(e) => debug!(
                    "Direct commit on '{}' failed, queueing: {}",
                    self.inner.channel, e
                ),
            }
        }

        let id = self.inner.enqueue(token, &action).await?;
        Ok(ApplyOutcome::Queued(id))
    }

    /// Current collection.
    pub fn items(&self) -> Vec<T> {
        lock(&self.inner.state).items.clone()
    }

    pub fn item(&self, id: &str) -> Option<T> {
        lock(&self.inner.state)
            .items
            .iter()
            .find(|item| item.id() == id)
            .cloned()
    }

    /// `None` when no item has this id.
    pub fn sync_state(&self, id: &str) -> Option<ItemSyncState> {
        let state = lock(&self.inner.state);
        if !state.items.iter().any(|item| item.id() == id) {
            return None;
        }
        Some(
            state
                .item_states
                .get(id)
                .copied()
                .unwrap_or(ItemSyncState::Synced),
        )
    }

    /// Number of local changes the remote has not confirmed.
    pub fn unsynced_count(&self) -> usize {
        lock(&self.inner.state).pending.len()
    }

    /// Bumped on every change to the collection.
    pub fn version(&self) -> u64 {
        lock(&self.inner.state).version
    }
}
