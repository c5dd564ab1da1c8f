//! Process-wide sync status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the engine exposes about unsynced state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub pending_mutation_count: usize,
    /// Last time a remote refresh or a queued mutation was delivered
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SyncStatus {
    pub fn new(is_online: bool, pending_mutation_count: usize) -> Self {
        Self {
            is_online,
            pending_mutation_count,
            last_synced_at: None,
        }
    }

    /// True when every local write has reached the remote.
    pub fn is_settled(&self) -> bool {
        self.pending_mutation_count == 0
    }
}
