//! Notification center: read/unread state reconciled with the remote.

use crate::consumer::{
    ApplyOutcome, Identified, ItemSyncState, OptimisticAction, ReconciliationConsumer,
    RemoteCommit,
};
use crate::coordinator::SyncCoordinator;
use crate::error::Result;
use crate::resource::{HydrateOptions, ResourceRegistration};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

pub const NOTIFICATION_CHANNEL: &str = "notification-center";
pub const NOTIFICATIONS_RESOURCE: &str = "notifications";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Identified for Notification {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Wire form is `{"type": "markRead", "id": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NotificationAction {
    MarkRead { id: String },
    MarkUnread { id: String },
}

impl NotificationAction {
    fn read_value(&self) -> bool {
        matches!(self, NotificationAction::MarkRead { .. })
    }
}

impl OptimisticAction<Notification> for NotificationAction {
    fn target_id(&self) -> &str {
        match self {
            NotificationAction::MarkRead { id } | NotificationAction::MarkUnread { id } => id,
        }
    }

    fn apply(&self, item: &mut Notification) -> bool {
        let read = self.read_value();
        if item.read == read {
            return false;
        }
        item.read = read;
        true
    }
}

pub struct NotificationCenter {
    consumer: ReconciliationConsumer<Notification, NotificationAction>,
}

impl NotificationCenter {
    /// Register the `notifications` resource and the `notification-center`
    /// replay channel on `coordinator`.
    pub fn new<F, Fut>(
        coordinator: &SyncCoordinator,
        loader: F,
        remote: Arc<dyn RemoteCommit<NotificationAction>>,
    ) -> Result<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<Notification>>> + Send + 'static,
    {
        let registration =
            ResourceRegistration::new(NOTIFICATIONS_RESOURCE, loader).with_tag("inbox");
        let consumer =
            ReconciliationConsumer::new(coordinator, registration, NOTIFICATION_CHANNEL, remote)?;
        Ok(Self { consumer })
    }

    /// Cache-first load.
    pub async fn load(&self) -> Result<Vec<Notification>> {
        self.consumer.load(HydrateOptions::default()).await
    }

    /// Wait for a fresh remote snapshot.
    pub async fn refresh(&self) -> Result<Vec<Notification>> {
        self.consumer.load(HydrateOptions::force()).await
    }

    pub async fn mark_read(&self, id: &str) -> Result<ApplyOutcome> {
        self.consumer
            .apply(NotificationAction::MarkRead { id: id.to_string() })
            .await
    }

    pub async fn mark_unread(&self, id: &str) -> Result<ApplyOutcome> {
        self.consumer
            .apply(NotificationAction::MarkUnread { id: id.to_string() })
            .await
    }

    /// Mark every unread notification read, one action per notification.
    pub async fn mark_all_read(&self) -> Result<Vec<ApplyOutcome>> {
        let unread: Vec<String> = self
            .consumer
            .items()
            .into_iter()
            .filter(|n| !n.read)
            .map(|n| n.id)
            .collect();

        let mut outcomes = Vec::with_capacity(unread.len());
        for id in unread {
            outcomes.push(self.mark_read(&id).await?);
        }
        Ok(outcomes)
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.consumer.items()
    }

    pub fn unread_count(&self) -> usize {
        self.consumer.items().iter().filter(|n| !n.read).count()
    }

    pub fn sync_state(&self, id: &str) -> Option<ItemSyncState> {
        self.consumer.sync_state(id)
    }
}
