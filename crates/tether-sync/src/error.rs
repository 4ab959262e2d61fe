//! Error types for the sync module.

use thiserror::Error;

use crate::protocol::ProtocolKind;

/// Errors that can occur during remote operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The transport could not complete the call.
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer answered with an error status.
    #[error("peer returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// The selected protocol has no implementation.
    #[error("protocol {0:?} is not supported")]
    Unsupported(ProtocolKind),

    /// A relation route needs its parent's server id, which is not known yet.
    #[error("relation parent has no server id yet")]
    Unbound,

    /// The peer answered with something we cannot decode.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The envelope cannot be pushed as requested.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A function-result hook failed.
    #[error("function hook failed: {0}")]
    Hook(String),
}

impl SyncError {
    /// Whether the envelope should go back to the offline queue.
    ///
    /// Failures to reach the peer are retried, and so are statuses that say
    /// the peer could not handle the request right now (5xx, 408, 429).
    /// Other client errors are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport(_) | SyncError::Unbound => true,
            SyncError::Status { status, .. } => *status >= 500 || matches!(status, 408 | 429),
            _ => false,
        }
    }
}


/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
