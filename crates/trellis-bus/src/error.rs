//! Error types for the Trellis bus layer.

use thiserror::Error;

/// Result type alias for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Main error type for bus publishing, subscriptions and correlated calls.
#[derive(Error, Debug, Clone)]
pub enum BusError {
    /// Publishing a payload to a channel failed.
    #[error("Publish to channel '{channel}' failed: {reason}")]
    Publish { channel: String, reason: String },

    /// The subscription feeding a call or pump was closed.
    #[error("Subscription to channel '{0}' closed")]
    ChannelClosed(String),

    /// A correlated call exceeded its deadline.
    #[error("Call on channel '{channel}' timed out after {timeout_ms}ms")]
    Timeout { channel: String, timeout_ms: u64 },

    /// A correlated call observed a cancellation signal.
    #[error("Call on channel '{0}' cancelled")]
    Cancelled(String),

    /// A payload could not be encoded or decoded.
    #[error("Payload codec error: {0}")]
    Codec(String),
}

impl BusError {
    /// Returns true if retrying the operation could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BusError::Publish { .. } | BusError::ChannelClosed(_) | BusError::Timeout { .. }
        )
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Codec(err.to_string())
    }
}
