//! Bus errors.

/// Message bus operation errors.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("no transport attached")]
    NoTransport,

    #[error("publish on {channel} failed: {reason}")]
    PublishFailed { channel: String, reason: String },

    #[error("subscribe for {pattern} failed: {reason}")]
    SubscribeFailed { pattern: String, reason: String },
}

impl BusError {
    pub(crate) fn publish(channel: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        BusError::PublishFailed {
            channel: channel.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn subscribe(pattern: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        BusError::SubscribeFailed {
            pattern: pattern.into(),
            reason: reason.to_string(),
        }
    }
}
