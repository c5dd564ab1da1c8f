//! Sync coordinator
//!
//! Owns the resource registry, the durable mutation queue and the per-channel
//! handler registry for one engine instance. Feature code hydrates resources
//! through it and hands it write intents it could not deliver directly; the
//! coordinator replays those intents whenever connectivity comes back.

use crate::cache::ResourceCache;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::handler::{HandlerRegistry, MutationHandler};
use crate::observer::{lock, ObserverSet, Subscription};
use crate::queue::{MutationId, MutationQueue, MutationRequest, QueuedMutation, QUEUE_TAG};
use crate::resource::{
    decode_hydrated, HydrateOptions, HydratedResource, PendingGuard, ResourceEntry,
    ResourceHandle, ResourceRegistration, Source,
};
use crate::retry::RetryPolicy;
use crate::status::SyncStatus;
use crate::store::{open_store, RecordStore};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct RemoteSnapshot {
    data: serde_json::Value,
    updated_at: DateTime<Utc>,
}

type SharedRefresh = Shared<BoxFuture<'static, std::result::Result<RemoteSnapshot, String>>>;

/// Which queued mutations a drain visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    /// Only mutations whose backoff has elapsed
    Due,
    /// Every queued mutation, ignoring backoff
    Full,
}

/// Outcome of one pass over the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    pub skipped_no_handler: usize,
    pub deferred: usize,
    /// The pass stopped early because the coordinator went offline
    pub halted_offline: bool,
}

impl DrainReport {
    fn offline() -> Self {
        Self {
            halted_offline: true,
            ..Self::default()
        }
    }
}

struct CoordinatorInner {
    cache: ResourceCache,
    queue: tokio::sync::Mutex<MutationQueue>,
    handlers: HandlerRegistry,
    resources: Mutex<HashMap<String, Arc<ResourceEntry>>>,
    inflight: Mutex<HashMap<String, SharedRefresh>>,
    status: Mutex<SyncStatus>,
    status_observers: ObserverSet<SyncStatus>,
    drain_lock: tokio::sync::Mutex<()>,
    retry: RetryPolicy,
    replay_interval: Option<Duration>,
    replay_task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

/// Handle to one sync engine instance. Clones share state.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl SyncCoordinator {
    /// Build a coordinator over `store`, restoring any mutations queued by a
    /// previous process.
    pub async fn create(store: Arc<dyn RecordStore>, config: &SyncConfig) -> Result<Self> {
        config.validate()?;
        let queue = MutationQueue::load(store.clone()).await?;
        let status = SyncStatus::new(config.start_online, queue.len());

        info!(
            "Sync coordinator ready ({} queued mutation(s), online: {})",
            status.pending_mutation_count, status.is_online
        );

        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                cache: ResourceCache::new(store),
                queue: tokio::sync::Mutex::new(queue),
                handlers: HandlerRegistry::new(),
                resources: Mutex::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
                status: Mutex::new(status),
                status_observers: ObserverSet::new(),
                drain_lock: tokio::sync::Mutex::new(()),
                retry: config.retry.to_policy(),
                replay_interval: config.replay_interval(),
                replay_task: Mutex::new(None),
                disposed: AtomicBool::new(false),
            }),
        })
    }

    /// Open the configured store and build a coordinator over it.
    pub async fn open(config: &SyncConfig) -> Result<Self> {
        let store = open_store(&config.store)?;
        Self::create(store, config).await
    }

    /// Tear the instance down. Observers and handlers are dropped and the
    /// replay task stops; persisted cache and queue records stay in place.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = lock(&self.inner.replay_task).take() {
            task.abort();
        }
        self.inner.status_observers.clear();
        for entry in lock(&self.inner.resources).values() {
            entry.observers.clear();
        }
        self.inner.handlers.clear();

        info!("Sync coordinator disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        if self.is_disposed() {
            Err(SyncError::Disposed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn cache(&self) -> &ResourceCache {
        &self.inner.cache
    }

    // ---- resources ----

    /// Register a resource and get a handle bound to its key.
    pub fn register_resource<T>(
        &self,
        registration: ResourceRegistration<T>,
    ) -> Result<ResourceHandle<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.ensure_active()?;
        let hydrate_now = registration.hydrate_on_register;
        let entry = Arc::new(registration.into_entry());

        {
            let mut resources = lock(&self.inner.resources);
            if resources.contains_key(&entry.key) {
                return Err(SyncError::DuplicateResource(entry.key.clone()));
            }
            resources.insert(entry.key.clone(), entry.clone());
        }
        debug!("Registered resource '{}'", entry.key);

        let handle = ResourceHandle::new(self.clone(), entry);
        if hydrate_now {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let initial = handle.clone();
                    runtime.spawn(async move {
                        if let Err(e) = initial.hydrate(HydrateOptions::default()).await {
                            warn!("Initial hydrate of '{}' failed: {}", initial.key(), e);
                        }
                    });
                }
                Err(_) => warn!(
                    "No async runtime available; skipping initial hydrate of '{}'",
                    handle.key()
                ),
            }
        }
        Ok(handle)
    }

    /// Hydrate a registered resource by key.
    ///
    /// Without `force`, a cached snapshot is returned immediately and a
    /// background refresh updates the cache when online. With no cached
    /// snapshot (or with `force`), the call waits for the remote. Concurrent
    /// refreshes of one key share a single remote fetch.
    pub async fn hydrate_resource<T: DeserializeOwned>(
        &self,
        key: &str,
        options: HydrateOptions,
    ) -> Result<HydratedResource<T>> {
        self.ensure_active()?;
        let entry = lock(&self.inner.resources)
            .get(key)
            .cloned()
            .ok_or_else(|| SyncError::UnregisteredResource(key.to_string()))?;
        self.hydrate_entry(&entry, options).await
    }

    pub(crate) async fn hydrate_entry<T: DeserializeOwned>(
        &self,
        entry: &Arc<ResourceEntry>,
        options: HydrateOptions,
    ) -> Result<HydratedResource<T>> {
        self.ensure_active()?;
        let guard = PendingGuard::new(entry.pending.clone());
        let online = self.is_online();
        if online {
            self.schedule_drain();
        }

        if !options.force {
            if let Some(cached) = self.cached_snapshot::<T>(&entry.key).await {
                if online {
                    let refresh = self.refresh(entry.clone());
                    tokio::spawn(async move {
                        let _guard = guard;
                        let _ = refresh.await;
                    });
                }
                return Ok(cached);
            }
        }

        let outcome = self.refresh(entry.clone()).await;
        drop(guard);

        match outcome {
            Ok(snapshot) => decode_hydrated(
                &entry.key,
                HydratedResource {
                    data: snapshot.data,
                    source: Source::Remote,
                    updated_at: Some(snapshot.updated_at),
                },
            ),
            Err(reason) => {
                if options.force {
                    if let Some(cached) = self.cached_snapshot::<T>(&entry.key).await {
                        debug!("Serving cached '{}' after failed forced refresh", entry.key);
                        return Ok(cached);
                    }
                }
                Err(SyncError::Unavailable {
                    key: entry.key.clone(),
                    reason,
                })
            }
        }
    }

    /// Cached snapshot for `key`, treating a record that no longer decodes
    /// as a miss.
    async fn cached_snapshot<T: DeserializeOwned>(&self, key: &str) -> Option<HydratedResource<T>> {
        let record = self.inner.cache.get_raw(key).await?;
        let raw = HydratedResource {
            data: record.data,
            source: Source::Cache,
            updated_at: Some(record.updated_at),
        };
        match decode_hydrated(key, raw) {
            Ok(cached) => Some(cached),
            Err(e) => {
                warn!("Ignoring cached '{}': {}", key, e);
                None
            }
        }
    }

    /// Start (or join) the remote refresh for one resource.
    fn refresh(&self, entry: Arc<ResourceEntry>) -> SharedRefresh {
        let mut inflight = lock(&self.inner.inflight);
        if let Some(existing) = inflight.get(&entry.key) {
            debug!("Joining in-flight refresh of '{}'", entry.key);
            return existing.clone();
        }

        let key = entry.key.clone();
        let coordinator = self.clone();
        let refresh = async move {
            let outcome = match (entry.loader)().await {
                Ok(data) => {
                    let updated_at = coordinator
                        .inner
                        .cache
                        .set_value(&entry.key, data.clone(), entry.tags.clone())
                        .await;
                    coordinator.update_status(|status| status.last_synced_at = Some(Utc::now()));
                    entry.observers.notify(&HydratedResource {
                        data: data.clone(),
                        source: Source::Remote,
                        updated_at: Some(updated_at),
                    });
                    Ok(RemoteSnapshot { data, updated_at })
                }
                Err(e) => {
                    warn!("Remote refresh of '{}' failed: {:#}", entry.key, e);
                    Err(format!("{:#}", e))
                }
            };
            lock(&coordinator.inner.inflight).remove(&entry.key);
            outcome
        }
        .boxed()
        .shared();

        inflight.insert(key, refresh.clone());
        drop(inflight);

        // Runs to completion even if every caller stops waiting.
        tokio::spawn(refresh.clone());
        refresh
    }

    /// Drop every cached record carrying `tag`. The queue's own tag is
    /// refused; queued mutations only leave through delivery.
    pub async fn invalidate_tag(&self, tag: &str) -> Result<Vec<String>> {
        self.ensure_active()?;
        if tag == QUEUE_TAG {
            return Err(SyncError::ReservedTag(tag.to_string()));
        }
        Ok(self.inner.cache.invalidate_tag(tag).await)
    }

    // ---- mutations ----

    /// Append a write intent to the durable queue. Resolves once the append
    /// is persisted; delivery happens on a later drain.
    pub async fn queue_mutation(&self, request: MutationRequest) -> Result<MutationId> {
        self.ensure_active()?;
        let mut queue = self.inner.queue.lock().await;
        let mutation = queue.push(request).await;
        let pending = queue.len();
        self.update_status(|status| status.pending_mutation_count = pending);
        drop(queue);

        debug!(
            "Queued mutation {} on '{}' ({} pending)",
            mutation.id, mutation.channel, pending
        );
        Ok(mutation.id)
    }

    /// Route replays for `channel` to `handler`. A later registration for the
    /// same channel replaces this one.
    pub fn register_mutation_handler<H>(
        &self,
        channel: impl Into<String>,
        handler: H,
    ) -> Result<Subscription>
    where
        H: MutationHandler + 'static,
    {
        self.ensure_active()?;
        Ok(self.inner.handlers.register(channel, Arc::new(handler)))
    }

    pub fn has_handler(&self, channel: &str) -> bool {
        self.inner.handlers.contains(channel)
    }

    /// Everything still waiting for delivery, oldest first.
    pub async fn pending_mutations(&self) -> Vec<QueuedMutation> {
        self.inner.queue.lock().await.snapshot()
    }

    /// Replay queued mutations whose backoff has elapsed.
    pub async fn drain(&self) -> Result<DrainReport> {
        self.ensure_active()?;
        Ok(self.run_drain(DrainMode::Due, true).await.unwrap_or_default())
    }

    /// Replay every queued mutation regardless of backoff.
    pub async fn flush(&self) -> Result<DrainReport> {
        self.ensure_active()?;
        Ok(self.run_drain(DrainMode::Full, true).await.unwrap_or_default())
    }

    /// Run one exclusive drain. With `wait` unset the call gives up instead of
    /// queueing behind a drain that is already running.
    async fn run_drain(&self, mode: DrainMode, wait: bool) -> Option<DrainReport> {
        let _running = if wait {
            self.inner.drain_lock.lock().await
        } else {
            self.inner.drain_lock.try_lock().ok()?
        };
        Some(self.drain_pass(mode).await)
    }

    fn schedule_drain(&self) {
        if self.get_status().pending_mutation_count == 0 {
            return;
        }
        let coordinator = self.clone();
        tokio::spawn(async move {
            if let Some(report) = coordinator.run_drain(DrainMode::Due, false).await {
                debug!("Lifecycle drain finished: {:?}", report);
            }
        });
    }

    async fn drain_pass(&self, mode: DrainMode) -> DrainReport {
        if !self.is_online() {
            return DrainReport::offline();
        }

        let pending = self.inner.queue.lock().await.snapshot();
        let now = Utc::now();
        let mut report = DrainReport::default();

        for mutation in pending {
            if self.is_disposed() {
                break;
            }
            if !self.is_online() {
                report.halted_offline = true;
                break;
            }

            let Some(handler) = self.inner.handlers.get(&mutation.channel) else {
                report.skipped_no_handler += 1;
                continue;
            };
            if mode == DrainMode::Due && !self.inner.retry.is_due(&mutation, now) {
                report.deferred += 1;
                continue;
            }

            report.attempted += 1;
            match handler.handle(&mutation).await {
                Ok(()) => {
                    report.delivered += 1;
                    let mut queue = self.inner.queue.lock().await;
                    queue.remove(&mutation.id).await;
                    let remaining = queue.len();
                    self.update_status(|status| {
                        status.pending_mutation_count = remaining;
                        status.last_synced_at = Some(Utc::now());
                    });
                }
                Err(e) => {
                    report.failed += 1;
                    let attempts = self
                        .inner
                        .queue
                        .lock()
                        .await
                        .record_failure(&mutation.id, &e, Utc::now())
                        .await;
                    warn!(
                        "Mutation {} on '{}' not applied (attempt {}): {}",
                        mutation.id,
                        mutation.channel,
                        attempts.unwrap_or(mutation.attempts + 1),
                        e
                    );
                }
            }
        }

        if report.attempted > 0 || report.skipped_no_handler > 0 {
            info!(
                "Drain finished: {} delivered, {} failed, {} without handler, {} deferred",
                report.delivered, report.failed, report.skipped_no_handler, report.deferred
            );
        }
        report
    }

    // ---- network ----

    /// Platform connectivity hook. Going from offline to online runs one full
    /// drain and returns its report.
    pub async fn handle_network_status_change(
        &self,
        is_online: bool,
    ) -> Result<Option<DrainReport>> {
        self.ensure_active()?;
        let was_online = self.is_online();
        self.update_status(|status| status.is_online = is_online);

        if is_online && !was_online {
            info!("Connectivity restored; draining mutation queue");
            Ok(self.run_drain(DrainMode::Full, true).await)
        } else {
            if !is_online && was_online {
                info!("Connectivity lost; queueing mutations locally");
            }
            Ok(None)
        }
    }

    pub fn is_online(&self) -> bool {
        lock(&self.inner.status).is_online
    }

    // ---- status ----

    pub fn get_status(&self) -> SyncStatus {
        lock(&self.inner.status).clone()
    }

    /// Observe every status change. Listeners run synchronously.
    pub fn subscribe(&self, listener: impl Fn(&SyncStatus) + Send + Sync + 'static) -> Subscription {
        if self.is_disposed() {
            return Subscription::detached();
        }
        self.inner.status_observers.subscribe(listener)
    }

    fn update_status(&self, apply: impl FnOnce(&mut SyncStatus)) {
        let changed = {
            let mut status = lock(&self.inner.status);
            let before = status.clone();
            apply(&mut status);
            (*status != before).then(|| status.clone())
        };
        if let Some(status) = changed {
            self.inner.status_observers.notify(&status);
        }
    }

    // ---- periodic replay ----

    /// Spawn the periodic replay task if `replay_interval_secs` is configured.
    /// Returns whether a task is running.
    pub fn start_replay_loop(&self) -> Result<bool> {
        self.ensure_active()?;
        let Some(period) = self.inner.replay_interval else {
            return Ok(false);
        };

        let mut slot = lock(&self.inner.replay_task);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(true);
        }

        info!("Starting replay loop every {} seconds", period.as_secs());
        let weak = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let coordinator = SyncCoordinator { inner };
                if coordinator.is_disposed() {
                    break;
                }
                if !coordinator.is_online() || coordinator.get_status().is_settled() {
                    continue;
                }
                if let Some(report) = coordinator.run_drain(DrainMode::Due, false).await {
                    debug!("Periodic replay finished: {:?}", report);
                }
            }
        }));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RetryableError;
    use crate::handler::handler_fn;
    use crate::store::MemoryRecordStore;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::{mpsc, Notify};

    fn config(online: bool) -> SyncConfig {
        SyncConfig {
            start_online: online,
            ..SyncConfig::default()
        }
    }

    async fn coordinator(online: bool) -> SyncCoordinator {
        SyncCoordinator::create(Arc::new(MemoryRecordStore::new()), &config(online))
            .await
            .unwrap()
    }

    fn recorder() -> (
        Arc<Mutex<Vec<serde_json::Value>>>,
        impl MutationHandler + 'static,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = handler_fn(move |m: QueuedMutation| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(m.payload);
                Ok(())
            }
        });
        (seen, handler)
    }

    #[tokio::test]
    async fn test_cache_first_then_background_refresh() {
        let sync = coordinator(true).await;
        let gate = Arc::new(Notify::new());
        let loader_gate = gate.clone();
        let projects = sync
            .register_resource(ResourceRegistration::new("projects", move || {
                let gate = loader_gate.clone();
                async move {
                    gate.notified().await;
                    Ok(vec!["remote".to_string()])
                }
            }))
            .unwrap();
        projects.store(&vec!["cached".to_string()]).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = projects.subscribe(move |snapshot| {
            let _ = tx.send(snapshot.data.clone());
        });

        let hydrated = projects.hydrate(HydrateOptions::default()).await.unwrap();
        assert_eq!(hydrated.source, Source::Cache);
        assert_eq!(hydrated.data, vec!["cached".to_string()]);
        assert!(projects.is_hydrating());

        gate.notify_one();
        let delivered = time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered, vec!["remote".to_string()]);

        let cached = projects.get_cached().await.unwrap().unwrap();
        assert_eq!(cached.data, vec!["remote".to_string()]);
        assert!(sync.get_status().last_synced_at.is_some());
    }

    #[tokio::test]
    async fn test_overlapping_hydrations_share_one_fetch() {
        let sync = coordinator(true).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let (loader_calls, loader_gate) = (calls.clone(), gate.clone());
        let equipment = sync
            .register_resource(ResourceRegistration::new("equipment", move || {
                let calls = loader_calls.clone();
                let gate = loader_gate.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                    Ok(7u32)
                }
            }))
            .unwrap();

        let (first, second, _) = tokio::join!(
            equipment.hydrate(HydrateOptions::force()),
            equipment.hydrate(HydrateOptions::force()),
            async {
                tokio::task::yield_now().await;
                gate.notify_one();
            }
        );

        assert_eq!(first.unwrap().data, 7);
        assert_eq!(second.unwrap().source, Source::Remote);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(equipment.pending_hydrations(), 0);
        assert!(!equipment.is_hydrating());
    }

    #[tokio::test]
    async fn test_is_hydrating_until_last_overlap_settles() {
        let sync = coordinator(true).await;
        let gate = Arc::new(Notify::new());
        let loader_gate = gate.clone();
        let equipment = sync
            .register_resource(ResourceRegistration::new("equipment", move || {
                let gate = loader_gate.clone();
                async move {
                    gate.notified().await;
                    Ok(vec![1u32])
                }
            }))
            .unwrap();
        equipment.store(&vec![0u32]).await.unwrap();

        let slow = {
            let equipment = equipment.clone();
            tokio::spawn(async move { equipment.hydrate(HydrateOptions::force()).await })
        };
        for _ in 0..100 {
            if equipment.pending_hydrations() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(equipment.pending_hydrations(), 1);

        // Offline cache-first hydration settles without touching the remote.
        sync.handle_network_status_change(false).await.unwrap();
        let quick = equipment.hydrate(HydrateOptions::default()).await.unwrap();
        assert_eq!(quick.source, Source::Cache);
        assert!(equipment.is_hydrating());

        gate.notify_one();
        let slow = slow.await.unwrap().unwrap();
        assert_eq!(slow.data, vec![1]);
        assert!(!equipment.is_hydrating());
    }

    #[tokio::test]
    async fn test_mismatched_cache_record_falls_back_to_remote() {
        let sync = coordinator(true).await;
        sync.cache()
            .set("projects", &"old schema", Default::default())
            .await;
        let projects = sync
            .register_resource(ResourceRegistration::new("projects", || async {
                Ok(vec![1u32, 2])
            }))
            .unwrap();

        let hydrated = projects.hydrate(HydrateOptions::default()).await.unwrap();

        assert_eq!(hydrated.source, Source::Remote);
        assert_eq!(hydrated.data, vec![1, 2]);
        assert_eq!(projects.get_cached().await.unwrap().unwrap().data, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_queue_tag_cannot_be_invalidated() {
        let sync = coordinator(false).await;
        sync.queue_mutation(MutationRequest::new("alerts", json!(1)))
            .await
            .unwrap();

        let err = sync.invalidate_tag(QUEUE_TAG).await.unwrap_err();
        assert!(matches!(err, SyncError::ReservedTag(_)));

        let keys = sync.cache().store().keys_with_tag(QUEUE_TAG).await.unwrap();
        assert_eq!(keys.len(), 1);
    }

    #[tokio::test]
    async fn test_remote_failure_without_cache_is_unavailable() {
        let sync = coordinator(true).await;
        let vendors = sync
            .register_resource(ResourceRegistration::<Vec<String>>::new("vendors", || async {
                Err(anyhow::anyhow!("502 bad gateway"))
            }))
            .unwrap();

        let err = vendors.hydrate(HydrateOptions::default()).await.unwrap_err();
        assert!(matches!(err, SyncError::Unavailable { ref key, .. } if key == "vendors"));

        vendors.store(&vec!["v-1".to_string()]).await.unwrap();
        let fallback = vendors.hydrate(HydrateOptions::force()).await.unwrap();
        assert_eq!(fallback.source, Source::Cache);
        assert_eq!(fallback.data, vec!["v-1".to_string()]);
    }

    #[tokio::test]
    async fn test_unsubscribed_listener_misses_snapshot_but_cache_updates() {
        let sync = coordinator(true).await;
        let projects = sync
            .register_resource(ResourceRegistration::new("projects", || async { Ok(3u32) }))
            .unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let sub = projects.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sub.unsubscribe();

        projects.hydrate(HydrateOptions::default()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(projects.get_cached().await.unwrap().unwrap().data, 3);
    }

    #[tokio::test]
    async fn test_unregistered_and_duplicate_resources() {
        let sync = coordinator(true).await;
        let err = sync
            .hydrate_resource::<u32>("missing", HydrateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnregisteredResource(_)));

        sync.register_resource(ResourceRegistration::new("alerts", || async { Ok(1u32) }))
            .unwrap();
        let err = sync
            .register_resource(ResourceRegistration::new("alerts", || async { Ok(2u32) }))
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::DuplicateResource(_)));

        let hydrated = sync
            .hydrate_resource::<u32>("alerts", HydrateOptions::default())
            .await
            .unwrap();
        assert_eq!(hydrated.data, 1);
    }

    #[tokio::test]
    async fn test_delivered_mutation_is_removed_once() {
        let sync = coordinator(true).await;
        let (seen, handler) = recorder();
        let _sub = sync.register_mutation_handler("alerts", handler).unwrap();

        sync.queue_mutation(MutationRequest::new("alerts", json!({"id": "a-1"})))
            .await
            .unwrap();
        assert_eq!(sync.get_status().pending_mutation_count, 1);

        let report = sync.flush().await.unwrap();
        assert_eq!(report.delivered, 1);
        let report = sync.flush().await.unwrap();
        assert_eq!(report.attempted, 0);

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(sync.get_status().is_settled());
        assert!(sync.get_status().last_synced_at.is_some());
    }

    #[tokio::test]
    async fn test_retry_until_success_counts_attempts() {
        let sync = coordinator(true).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let attempts_at_success = Arc::new(Mutex::new(None));
        let (counter, observed) = (calls.clone(), attempts_at_success.clone());
        let _sub = sync
            .register_mutation_handler(
                "procurement",
                handler_fn(move |m: QueuedMutation| {
                    let counter = counter.clone();
                    let observed = observed.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                            return Err(RetryableError::new("remote unavailable"));
                        }
                        *observed.lock().unwrap() = Some(m.attempts);
                        Ok(())
                    }
                }),
            )
            .unwrap();

        sync.queue_mutation(MutationRequest::new("procurement", json!({"approve": "po-1"})))
            .await
            .unwrap();

        for _ in 0..2 {
            let report = sync.flush().await.unwrap();
            assert_eq!(report.failed, 1);
            assert_eq!(sync.pending_mutations().await.len(), 1);
        }
        let pending = sync.pending_mutations().await;
        assert_eq!(pending[0].attempts, 2);
        assert_eq!(pending[0].last_error.as_deref(), Some("remote unavailable"));

        assert_eq!(sync.flush().await.unwrap().delivered, 1);
        assert_eq!(*attempts_at_success.lock().unwrap(), Some(2));
        assert!(sync.pending_mutations().await.is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_drains_once_in_fifo_order() {
        let sync = coordinator(false).await;
        let (seen, handler) = recorder();
        let _sub = sync.register_mutation_handler("alerts", handler).unwrap();
        let (other_seen, other) = recorder();
        let _other = sync.register_mutation_handler("procurement", other).unwrap();

        for i in 0..3 {
            sync.queue_mutation(MutationRequest::new("alerts", json!(i)))
                .await
                .unwrap();
        }
        sync.queue_mutation(MutationRequest::new("procurement", json!("po")))
            .await
            .unwrap();

        let report = sync.handle_network_status_change(true).await.unwrap().unwrap();
        assert_eq!(report.delivered, 4);
        assert_eq!(*seen.lock().unwrap(), vec![json!(0), json!(1), json!(2)]);
        assert_eq!(other_seen.lock().unwrap().len(), 1);

        assert!(sync.handle_network_status_change(true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mutation_without_handler_is_retained() {
        let sync = coordinator(true).await;
        sync.queue_mutation(MutationRequest::new("inventory", json!({"id": "eq-1"})))
            .await
            .unwrap();

        let report = sync.flush().await.unwrap();
        assert_eq!(report.skipped_no_handler, 1);
        assert_eq!(sync.get_status().pending_mutation_count, 1);

        let (seen, handler) = recorder();
        let _sub = sync.register_mutation_handler("inventory", handler).unwrap();
        assert_eq!(sync.flush().await.unwrap().delivered, 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_due_drain_respects_backoff() {
        let mut config = config(true);
        config.retry.initial_delay_ms = 60_000;
        config.retry.max_delay_ms = 60_000;
        let sync = SyncCoordinator::create(Arc::new(MemoryRecordStore::new()), &config)
            .await
            .unwrap();
        let _sub = sync
            .register_mutation_handler(
                "alerts",
                handler_fn(|_m| async { Err(RetryableError::new("timeout")) }),
            )
            .unwrap();
        sync.queue_mutation(MutationRequest::new("alerts", json!(1)))
            .await
            .unwrap();

        assert_eq!(sync.drain().await.unwrap().failed, 1);
        let report = sync.drain().await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(report.attempted, 0);
        assert_eq!(sync.flush().await.unwrap().attempted, 1);
    }

    #[tokio::test]
    async fn test_drain_while_offline_does_nothing() {
        let sync = coordinator(false).await;
        let (seen, handler) = recorder();
        let _sub = sync.register_mutation_handler("alerts", handler).unwrap();
        sync.queue_mutation(MutationRequest::new("alerts", json!(1)))
            .await
            .unwrap();

        let report = sync.flush().await.unwrap();
        assert!(report.halted_offline);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_listeners_follow_changes() {
        let sync = coordinator(true).await;
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        let sub = sync.subscribe(move |status| sink.lock().unwrap().push(status.clone()));

        sync.queue_mutation(MutationRequest::new("alerts", json!(1)))
            .await
            .unwrap();
        sync.handle_network_status_change(false).await.unwrap();
        sub.unsubscribe();
        sync.handle_network_status_change(true).await.unwrap();

        let updates = updates.lock().unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].pending_mutation_count, 1);
        assert!(!updates[1].is_online);
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let first = SyncCoordinator::create(store.clone(), &config(false))
            .await
            .unwrap();
        let id = first
            .queue_mutation(MutationRequest::new("alerts", json!({"id": "a-9"})))
            .await
            .unwrap();
        first.dispose();

        let second = SyncCoordinator::create(store, &config(false)).await.unwrap();
        assert_eq!(second.get_status().pending_mutation_count, 1);
        assert_eq!(second.pending_mutations().await[0].id, id);
    }

    #[tokio::test]
    async fn test_disposed_coordinator_rejects_calls() {
        let sync = coordinator(true).await;
        let alerts = sync
            .register_resource(ResourceRegistration::new("alerts", || async { Ok(1u32) }))
            .unwrap();
        sync.dispose();

        assert!(matches!(
            sync.queue_mutation(MutationRequest::new("alerts", json!(1))).await,
            Err(SyncError::Disposed)
        ));
        assert!(matches!(
            alerts.hydrate(HydrateOptions::default()).await,
            Err(SyncError::Disposed)
        ));
        assert!(sync.start_replay_loop().is_err());
    }

    #[tokio::test]
    async fn test_replay_loop_drains_periodically() {
        let mut config = config(true);
        config.replay_interval_secs = Some(1);
        let sync = SyncCoordinator::create(Arc::new(MemoryRecordStore::new()), &config)
            .await
            .unwrap();
        let (seen, handler) = recorder();
        let _sub = sync.register_mutation_handler("alerts", handler).unwrap();
        sync.queue_mutation(MutationRequest::new("alerts", json!(1)))
            .await
            .unwrap();

        assert!(sync.start_replay_loop().unwrap());
        time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(sync.get_status().is_settled());
    }

    #[tokio::test]
    async fn test_replay_loop_disabled_without_interval() {
        let sync = coordinator(true).await;
        assert!(!sync.start_replay_loop().unwrap());
    }
}
