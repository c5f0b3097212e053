//! Error taxonomy shared by every layer of the sync pipeline.
//!
//! Each IO crate keeps a narrower error of its own (`StoreError`,
//! `DeliveryError`, `IngestError`) and converts into [`SyncError`] at the
//! boundary where callers need a single type.

use thiserror::Error;

use crate::telemetry::MessageType;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Send or connect failure. The caller owns retry scheduling.
    #[error("transport error: {detail}")]
    Transport { detail: String, retryable: bool },

    /// Malformed payload. Dropped and logged; never fatal to a stream.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Sequence at or below the last applied one for its lineage.
    /// Built from `ApplyOutcome::Stale` by `ApplyOutcome::into_result`.
    #[error("stale {message_type} update: sequence {sequence} <= applied {applied}")]
    StaleUpdate {
        message_type: MessageType,
        sequence: u64,
        applied: u64,
    },

    /// Persistence failure on insert/delete. Always propagated.
    #[error("storage error: {0}")]
    Storage(String),
}

impl SyncError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            Self::Storage(_) => true,
            Self::Validation(_) | Self::StaleUpdate { .. } => false,
        }
    }
}

/// A payload that cannot be accepted as its declared type.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("malformed {message_type} payload: {detail}")]
    Malformed {
        message_type: MessageType,
        detail: String,
    },

    #[error("malformed envelope: {0}")]
    Envelope(String),

    #[error("field {field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("invalid mpg operation {index} ({kind}): {detail}")]
    Operation {
        index: usize,
        kind: String,
        detail: String,
    },
}

impl ValidationError {
    pub fn malformed(message_type: MessageType, detail: impl ToString) -> Self {
        Self::Malformed {
            message_type,
            detail: detail.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_hint_follows_taxonomy() {
        let transport = SyncError::Transport {
            detail: "connection refused".into(),
            retryable: true,
        };
        assert!(transport.is_retryable());

        let permanent = SyncError::Transport {
            detail: "422".into(),
            retryable: false,
        };
        assert!(!permanent.is_retryable());

        let invalid = SyncError::from(ValidationError::Envelope("missing sequence".into()));
        assert!(!invalid.is_retryable());
        assert!(SyncError::Storage("disk full".into()).is_retryable());
    }

    #[test]
    fn display_names_the_message_type() {
        let err = SyncError::StaleUpdate {
            message_type: MessageType::SymbolicState,
            sequence: 3,
            applied: 5,
        };
        assert_eq!(
            err.to_string(),
            "stale symbolic_state update: sequence 3 <= applied 5"
        );
    }
}
