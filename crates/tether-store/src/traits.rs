//! LocalAdapter trait: the abstract interface for local persistence.
//!
//! Each adapter instance serves one entity type (or one relationship) and
//! knows which record field holds its key.

use async_trait::async_trait;
use serde_json::Value;
use tether_core::StoreId;
use tokio::sync::watch;

use crate::error::Result;

/// Result of writing one record.
#[derive(Debug, Clone, PartialEq)]
pub struct PutResult {
    /// The key the record was written under.
    pub key: StoreId,
    /// The record as stored, key field included.
    pub record: Value,
}

/// The LocalAdapter trait: async interface for record persistence.
///
/// # Design Notes
///
/// - **Unavailable backend**: every operation fails with
///   [`StoreError::NoConnection`](crate::StoreError::NoConnection) and leaves
///   storage untouched.
/// - **Keyed upserts**: `put` keeps a key already present in the record and
///   assigns the next free key otherwise.
/// - **Removal is idempotent**: removing a record that is not stored succeeds.
#[async_trait]
pub trait LocalAdapter: Send + Sync {
    /// Name of the record field holding the local key.
    fn local_key(&self) -> &str;

    /// Connectivity signal: `true` while the backend accepts operations.
    fn connectivity(&self) -> watch::Receiver<bool>;

    /// Whether the backend currently accepts operations.
    fn is_connected(&self) -> bool {
        *self.connectivity().borrow()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Record Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Enumerate every stored record, ordered by key.
    async fn get_all_entries(&self) -> Result<Vec<Value>>;

    /// Get one record by key.
    async fn get_entry(&self, key: StoreId) -> Result<Option<Value>>;

    /// Write records, returning the key each one landed under.
    async fn put(&self, records: Vec<Value>) -> Result<Vec<PutResult>>;

    /// Remove a record (located through its key field).
    async fn remove(&self, record: &Value) -> Result<Value>;

    // ─────────────────────────────────────────────────────────────────────────
    // Metadata Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Read a metadata value.
    async fn get_metadata(&self, key: &str) -> Result<Option<Value>>;

    /// Write a metadata value.
    async fn set_metadata(&self, key: &str, value: Value) -> Result<()>;
}

/// Extension trait for common adapter patterns.
pub trait LocalAdapterExt: LocalAdapter {
    /// Write a single record.
    fn put_one(
        &self,
        record: Value,
    ) -> impl std::future::Future<Output = Result<PutResult>> + Send;
}

impl<A: LocalAdapter + ?Sized> LocalAdapterExt for A {
    async fn put_one(&self, record: Value) -> Result<PutResult> {
        self.put(vec![record])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| crate::StoreError::Transaction("put returned no result".into()))
    }
}
