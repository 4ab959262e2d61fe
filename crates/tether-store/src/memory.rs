//! In-memory implementation of the LocalAdapter trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite but
//! keeps everything in memory, and its connection can be toggled and its
//! next write made to fail.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;
use tether_core::StoreId;
use tokio::sync::watch;

use crate::error::{Result, StoreError};
use crate::traits::{LocalAdapter, PutResult};

/// In-memory adapter.
///
/// All data is lost when the adapter is dropped. Thread-safe via RwLock.
pub struct MemoryAdapter {
    local_key: String,
    inner: RwLock<MemoryAdapterInner>,
    connected: watch::Sender<bool>,
}

struct MemoryAdapterInner {
    /// Records indexed by key.
    records: BTreeMap<StoreId, Value>,

    /// Next key handed out to a record without one.
    next_key: u64,

    /// Metadata key/value pairs.
    metadata: HashMap<String, Value>,

    /// Error the next write fails with.
    fail_next: Option<String>,
}

impl MemoryAdapter {
    /// Create an empty, connected adapter whose first assigned key is 1.
    pub fn new(local_key: impl Into<String>) -> Self {
        let (connected, _) = watch::channel(true);
        Self {
            local_key: local_key.into(),
            inner: RwLock::new(MemoryAdapterInner {
                records: BTreeMap::new(),
                next_key: 1,
                metadata: HashMap::new(),
                fail_next: None,
            }),
            connected,
        }
    }

    /// Start assigning keys at `first_key`.
    pub fn with_first_key(self, first_key: u64) -> Self {
        self.write_inner().next_key = first_key;
        self
    }

    /// Flip the connectivity signal.
    pub fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
    }

    /// Make the next write fail with a transaction error.
    pub fn fail_next_write(&self, message: impl Into<String>) {
        self.write_inner().fail_next = Some(message.into());
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.read_inner().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of one record, bypassing the connectivity check.
    pub fn peek(&self, key: StoreId) -> Option<Value> {
        self.read_inner().records.get(&key).cloned()
    }

    fn read_inner(&self) -> std::sync::RwLockReadGuard<'_, MemoryAdapterInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_inner(&self) -> std::sync::RwLockWriteGuard<'_, MemoryAdapterInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_connected(&self) -> Result<()> {
        if *self.connected.borrow() {
            Ok(())
        } else {
            Err(StoreError::NoConnection)
        }
    }

    fn key_of(&self, record: &Value) -> Result<Option<StoreId>> {
        match record.get(&self.local_key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => StoreId::from_value(value).map(Some).ok_or_else(|| {
                StoreError::InvalidData(format!("bad {} value: {value}", self.local_key))
            }),
        }
    }
}

#[async_trait]
impl LocalAdapter for MemoryAdapter {
    fn local_key(&self) -> &str {
        &self.local_key
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    async fn get_all_entries(&self) -> Result<Vec<Value>> {
        self.ensure_connected()?;
        Ok(self.read_inner().records.values().cloned().collect())
    }

    async fn get_entry(&self, key: StoreId) -> Result<Option<Value>> {
        self.ensure_connected()?;
        Ok(self.read_inner().records.get(&key).cloned())
    }

    async fn put(&self, records: Vec<Value>) -> Result<Vec<PutResult>> {
        self.ensure_connected()?;

        let keys = records
            .iter()
            .map(|record| {
                if !record.is_object() {
                    return Err(StoreError::InvalidData("record is not an object".into()));
                }
                self.key_of(record)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut inner = self.write_inner();
        if let Some(message) = inner.fail_next.take() {
            return Err(StoreError::Transaction(message));
        }

        let mut results = Vec::with_capacity(records.len());
        for (mut record, key) in records.into_iter().zip(keys) {
            let key = match key {
                Some(key) => {
                    if key.get() >= inner.next_key {
                        inner.next_key = key.get() + 1;
                    }
                    key
                }
                None => {
                    let key = StoreId(inner.next_key);
                    inner.next_key += 1;
                    key
                }
            };

            if let Value::Object(map) = &mut record {
                map.insert(self.local_key.clone(), Value::from(key.get()));
            }
            inner.records.insert(key, record.clone());
            results.push(PutResult { key, record });
        }

        Ok(results)
    }

    async fn remove(&self, record: &Value) -> Result<Value> {
        self.ensure_connected()?;
        let key = self
            .key_of(record)?
            .ok_or_else(|| StoreError::InvalidData(format!("record has no {}", self.local_key)))?;

        let mut inner = self.write_inner();
        if let Some(message) = inner.fail_next.take() {
            return Err(StoreError::Transaction(message));
        }
        Ok(inner.records.remove(&key).unwrap_or_else(|| record.clone()))
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<Value>> {
        self.ensure_connected()?;
        Ok(self.read_inner().metadata.get(key).cloned())
    }

    async fn set_metadata(&self, key: &str, value: Value) -> Result<()> {
        self.ensure_connected()?;
        self.write_inner().metadata.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::LocalAdapterExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_adapter_assigns_keys() {
        let adapter = MemoryAdapter::new("_id").with_first_key(101);

        let first = adapter.put_one(json!({"title": "a"})).await.unwrap();
        let second = adapter.put_one(json!({"title": "b"})).await.unwrap();

        assert_eq!(first.key, StoreId(101));
        assert_eq!(second.key, StoreId(102));
        assert_eq!(first.record, json!({"title": "a", "_id": 101}));
    }

    #[tokio::test]
    async fn test_memory_adapter_upserts_explicit_key() {
        let adapter = MemoryAdapter::new("_id");

        adapter.put_one(json!({"_id": 7, "v": 1})).await.unwrap();
        adapter.put_one(json!({"_id": 7, "v": 2})).await.unwrap();
        let next = adapter.put_one(json!({"v": 3})).await.unwrap();

        assert_eq!(adapter.len(), 2);
        assert_eq!(adapter.peek(StoreId(7)), Some(json!({"_id": 7, "v": 2})));
        assert_eq!(next.key, StoreId(8));
    }

    #[tokio::test]
    async fn test_memory_adapter_no_connection() {
        let adapter = MemoryAdapter::new("_id");
        adapter.set_connected(false);

        let err = adapter.put_one(json!({"v": 1})).await.unwrap_err();
        assert!(matches!(err, StoreError::NoConnection));
        assert!(adapter.is_empty());
        assert!(!adapter.is_connected());
    }

    #[tokio::test]
    async fn test_memory_adapter_injected_failure() {
        let adapter = MemoryAdapter::new("_id");
        adapter.fail_next_write("disk full");

        let err = adapter.put_one(json!({"v": 1})).await.unwrap_err();
        assert!(matches!(err, StoreError::Transaction(ref m) if m == "disk full"));

        // Only the next write fails.
        assert!(adapter.put_one(json!({"v": 1})).await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_adapter_remove_and_metadata() {
        let adapter = MemoryAdapter::new("_id");
        let written = adapter.put_one(json!({"v": 1})).await.unwrap();

        adapter.remove(&written.record).await.unwrap();
        assert!(adapter.get_entry(written.key).await.unwrap().is_none());
        // Removing again is not an error.
        adapter.remove(&written.record).await.unwrap();

        adapter.set_metadata("lastFetch", json!("v3")).await.unwrap();
        assert_eq!(adapter.get_metadata("lastFetch").await.unwrap(), Some(json!("v3")));
    }
}
