//! Store error categories.
//!
//! Backend-specific failures never cross this crate's boundary; every
//! caller sees one of these categories.

use mergeflow_types::TransitionError;

/// Store operation errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Connection closed, command timed out, or the latest health probe
    /// failed inside the configured window.
    #[error("coordination store unavailable: {reason}")]
    Unavailable { reason: String },

    /// Compare-and-set lost against a concurrent writer.
    #[error("conflict on key {key}")]
    Conflict { key: String },

    /// The requested write would violate a state-machine invariant.
    #[error("invariant violation: {0}")]
    InvariantViolation(#[from] TransitionError),

    /// A stored value failed to decode.
    #[error("corrupt value at {key}: {reason}")]
    Codec { key: String, reason: String },
}

impl StoreError {
    pub(crate) fn unavailable(err: impl std::fmt::Display) -> Self {
        StoreError::Unavailable {
            reason: err.to_string(),
        }
    }

    pub(crate) fn codec(key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        StoreError::Codec {
            key: key.into(),
            reason: err.to_string(),
        }
    }

    /// True for failures worth a jittered retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::unavailable(err)
    }
}
