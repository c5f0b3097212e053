use std::time::Duration;

use telesync_core::SyncError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("queue store lock poisoned")]
    Poisoned,

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Storage(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote rejected batch with status {status}")]
    Rejected { status: u16, retryable: bool },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DeliveryError {
    /// Whether the same batch may be accepted on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) | Self::Store(_) => true,
            Self::Rejected { retryable, .. } => *retryable,
        }
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        DeliveryError::Transport(e.to_string())
    }
}

impl From<DeliveryError> for SyncError {
    fn from(e: DeliveryError) -> Self {
        match e {
            DeliveryError::Store(store) => store.into(),
            other => SyncError::Transport {
                retryable: other.is_retryable(),
                detail: other.to_string(),
            },
        }
    }
}
