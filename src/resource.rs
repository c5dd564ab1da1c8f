//! Resource registrations and the handles features hydrate through.

use crate::cache::CacheRecord;
use crate::coordinator::SyncCoordinator;
use crate::error::{Result, SyncError};
use crate::observer::{ObserverSet, Subscription};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

type Loader<T> = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

/// Where a hydrated snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Cache,
    Remote,
}

/// Result of a hydration call.
#[derive(Debug, Clone, PartialEq)]
pub struct HydratedResource<T> {
    pub data: T,
    pub source: Source,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HydrateOptions {
    /// Skip the cached snapshot and wait for the remote
    pub force: bool,
}

impl HydrateOptions {
    pub fn force() -> Self {
        Self { force: true }
    }
}

/// How a feature's resource is fetched from the remote.
pub struct ResourceRegistration<T> {
    pub key: String,
    pub hydrate_on_register: bool,
    pub tags: BTreeSet<String>,
    loader: Loader<T>,
}

impl<T: Send + 'static> ResourceRegistration<T> {
    pub fn new<F, Fut>(key: impl Into<String>, loader: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            key: key.into(),
            hydrate_on_register: false,
            tags: BTreeSet::new(),
            loader: Arc::new(move || loader().boxed()),
        }
    }

    pub fn with_hydrate_on_register(mut self, hydrate: bool) -> Self {
        self.hydrate_on_register = hydrate;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub(crate) fn into_entry(self) -> ResourceEntry
    where
        T: Serialize,
    {
        let loader = self.loader;
        ResourceEntry {
            key: self.key,
            tags: self.tags,
            loader: Arc::new(move || {
                let pending = loader();
                async move {
                    let data = pending.await?;
                    Ok(serde_json::to_value(data)?)
                }
                .boxed()
            }),
            observers: ObserverSet::new(),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Type-erased registration owned by the coordinator.
pub(crate) struct ResourceEntry {
    pub(crate) key: String,
    pub(crate) tags: BTreeSet<String>,
    pub(crate) loader: Loader<serde_json::Value>,
    pub(crate) observers: ObserverSet<HydratedResource<serde_json::Value>>,
    pub(crate) pending: Arc<AtomicUsize>,
}

/// Counts one outstanding hydration for as long as it is alive.
pub(crate) struct PendingGuard {
    counter: Arc<AtomicUsize>,
}

impl PendingGuard {
    pub(crate) fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        // floor at zero
        let _ = self
            .counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }
}

pub(crate) fn decode_hydrated<T: DeserializeOwned>(
    key: &str,
    raw: HydratedResource<serde_json::Value>,
) -> Result<HydratedResource<T>> {
    let data = serde_json::from_value(raw.data).map_err(|source| SyncError::Decode {
        key: key.to_string(),
        source,
    })?;
    Ok(HydratedResource {
        data,
        source: raw.source,
        updated_at: raw.updated_at,
    })
}

/// Handle bound to one registered resource key.
pub struct ResourceHandle<T> {
    coordinator: SyncCoordinator,
    entry: Arc<ResourceEntry>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ResourceHandle<T> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            entry: self.entry.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> ResourceHandle<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn new(coordinator: SyncCoordinator, entry: Arc<ResourceEntry>) -> Self {
        Self {
            coordinator,
            entry,
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> &str {
        &self.entry.key
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.entry.tags
    }

    /// Cache-first hydration; see [`SyncCoordinator::hydrate_resource`].
    pub async fn hydrate(&self, options: HydrateOptions) -> Result<HydratedResource<T>> {
        self.coordinator.hydrate_entry(&self.entry, options).await
    }

    pub async fn get_cached(&self) -> Result<Option<CacheRecord<T>>> {
        self.coordinator.ensure_active()?;
        Ok(self.coordinator.cache().get(&self.entry.key).await)
    }

    /// Persist a locally produced snapshot under this resource's key.
    pub async fn store(&self, data: &T) -> Result<DateTime<Utc>> {
        self.coordinator.ensure_active()?;
        Ok(self
            .coordinator
            .cache()
            .set(&self.entry.key, data, self.entry.tags.clone())
            .await)
    }

    /// Drop the cached snapshot for this key.
    pub async fn invalidate(&self) -> Result<bool> {
        self.coordinator.ensure_active()?;
        Ok(self.coordinator.cache().invalidate(&self.entry.key).await)
    }

    /// Receive every snapshot a remote refresh commits for this key.
    pub fn subscribe(
        &self,
        listener: impl Fn(&HydratedResource<T>) + Send + Sync + 'static,
    ) -> Subscription {
        let key = self.entry.key.clone();
        self.entry
            .observers
            .subscribe(move |raw: &HydratedResource<serde_json::Value>| {
                match decode_hydrated::<T>(&key, raw.clone()) {
                    Ok(snapshot) => listener(&snapshot),
                    Err(e) => warn!("Dropping undeliverable snapshot: {}", e),
                }
            })
    }

    pub fn pending_hydrations(&self) -> usize {
        self.entry.pending.load(Ordering::SeqCst)
    }

    pub fn is_hydrating(&self) -> bool {
        self.pending_hydrations() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_guard_floors_at_zero() {
        let counter = Arc::new(AtomicUsize::new(0));
        let first = PendingGuard::new(counter.clone());
        let second = PendingGuard::new(counter.clone());
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        drop(first);
        counter.store(0, Ordering::SeqCst);
        drop(second);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_entry_loader_serializes_typed_result() {
        let registration = ResourceRegistration::new("projects", || async {
            Ok(vec!["p-1".to_string(), "p-2".to_string()])
        })
        .with_tag("projects")
        .with_hydrate_on_register(true);

        assert!(registration.hydrate_on_register);
        let entry = registration.into_entry();
        let value = (entry.loader)().await.unwrap();

        assert_eq!(value, serde_json::json!(["p-1", "p-2"]));
        assert!(entry.tags.contains("projects"));
    }

    #[test]
    fn test_decode_reports_key() {
        let raw = HydratedResource {
            data: serde_json::json!("not a number"),
            source: Source::Cache,
            updated_at: None,
        };
        let err = decode_hydrated::<u32>("equipment", raw).unwrap_err();
        assert!(matches!(err, SyncError::Decode { ref key, .. } if key == "equipment"));
    }
}
