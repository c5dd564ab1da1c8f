//! Error types for the sync engine.

/// Errors surfaced by the sync engine.
///
/// Network and storage failures are recovered internally (retry, queue, or
/// in-memory fallback). What reaches callers is mostly wiring defects and
/// hydration calls that had nothing to return.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("resource '{0}' was never registered")]
    UnregisteredResource(String),

    #[error("resource '{0}' is already registered")]
    DuplicateResource(String),

    #[error("sync coordinator has been disposed")]
    Disposed,

    #[error("no data available for resource '{key}': {reason}")]
    Unavailable { key: String, reason: String },

    #[error("failed to decode resource '{key}': {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("tag '{0}' is reserved for the mutation queue")]
    ReservedTag(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Signal from a remote call that the write was not applied and should be
/// retried later.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RetryableError {
    message: String,
}

impl RetryableError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<anyhow::Error> for RetryableError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{:#}", err))
    }
}

impl From<&str> for RetryableError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}
