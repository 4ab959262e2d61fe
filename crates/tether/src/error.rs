//! Error types for the engine.

use tether_core::{CoreError, RtId};
use tether_store::StoreError;
use tether_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Envelope or record error.
    #[error("data error: {0}")]
    Core(#[from] CoreError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Configuration could not be read.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Opening a collection's local store failed.
    #[error("storage setup failed: {0}")]
    Setup(#[from] anyhow::Error),

    /// No collection with this name.
    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    /// No relationship with this name, or no open set for it.
    #[error("unknown relationship: {0}")]
    UnknownRelation(String),

    /// No live entity with this runtime id.
    #[error("unknown entity {rt_id} in {collection}")]
    UnknownEntity { collection: String, rt_id: RtId },

    /// Invalid operation.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
