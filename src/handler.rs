//! Channel mutation handlers.
//!
//! A handler performs one queued mutation against the remote. Returning
//! `Ok(())` means the remote has durably applied the payload; returning a
//! [`RetryableError`] keeps the mutation queued for a later drain. Delivery is
//! at-least-once, so handlers must tolerate replays of the same mutation.

use crate::error::RetryableError;
use crate::observer::{lock, Subscription};
use crate::queue::QueuedMutation;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

#[async_trait]
pub trait MutationHandler: Send + Sync {
    async fn handle(&self, mutation: &QueuedMutation) -> Result<(), RetryableError>;
}

/// Adapter turning an async closure into a [`MutationHandler`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap a closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(QueuedMutation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), RetryableError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> MutationHandler for FnHandler<F>
where
    F: Fn(QueuedMutation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), RetryableError>> + Send + 'static,
{
    async fn handle(&self, mutation: &QueuedMutation) -> Result<(), RetryableError> {
        (self.f)(mutation.clone()).await
    }
}

struct HandlerEntry {
    generation: u64,
    handler: Arc<dyn MutationHandler>,
}

#[derive(Default)]
struct RegistryInner {
    next_generation: AtomicU64,
    entries: Mutex<HashMap<String, HandlerEntry>>,
}

/// One active handler per channel.
///
/// Registering over an existing channel replaces the previous handler. Each
/// registration has its own generation, so unsubscribing a replaced handler
/// never removes its replacement.
#[derive(Default)]
pub struct HandlerRegistry {
    inner: Arc<RegistryInner>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        channel: impl Into<String>,
        handler: Arc<dyn MutationHandler>,
    ) -> Subscription {
        let channel = channel.into();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);

        let previous = lock(&self.inner.entries).insert(
            channel.clone(),
            HandlerEntry {
                generation,
                handler,
            },
        );
        if previous.is_some() {
            warn!("Replacing existing mutation handler for channel '{}'", channel);
        } else {
            debug!("Registered mutation handler for channel '{}'", channel);
        }

        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut entries = lock(&inner.entries);
            if entries
                .get(&channel)
                .is_some_and(|entry| entry.generation == generation)
            {
                entries.remove(&channel);
                debug!("Unregistered mutation handler for channel '{}'", channel);
            }
        })
    }

    pub fn get(&self, channel: &str) -> Option<Arc<dyn MutationHandler>> {
        lock(&self.inner.entries)
            .get(channel)
            .map(|entry| entry.handler.clone())
    }

    pub fn contains(&self, channel: &str) -> bool {
        lock(&self.inner.entries).contains_key(channel)
    }

    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = lock(&self.inner.entries).keys().cloned().collect();
        channels.sort();
        channels
    }

    pub fn clear(&self) {
        lock(&self.inner.entries).clear();
    }
}
