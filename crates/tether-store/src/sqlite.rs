//! SQLite implementation of the LocalAdapter trait.
//!
//! This is the persistent backend. It uses rusqlite with bundled SQLite,
//! wrapped in async via tokio::spawn_blocking. Records and metadata values
//! are stored as CBOR blobs.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tether_core::StoreId;
use tokio::sync::watch;

use crate::error::{Result, StoreError};
use crate::migration::{self, now_millis};
use crate::traits::{LocalAdapter, PutResult};

/// SQLite-based adapter for one collection.
///
/// Several adapters can share one database file through [`SqliteAdapter::share`];
/// each sees only the rows of its own collection.
pub struct SqliteAdapter {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
    /// Collection name rows are scoped to.
    collection: String,
    /// Record field holding the key.
    local_key: String,
    /// Always `true` once the database is open.
    connected: watch::Sender<bool>,
}

impl SqliteAdapter {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(
        path: impl AsRef<Path>,
        collection: impl Into<String>,
        local_key: impl Into<String>,
    ) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self::from_conn(Arc::new(Mutex::new(conn)), collection, local_key))
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory(collection: impl Into<String>, local_key: impl Into<String>) -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self::from_conn(Arc::new(Mutex::new(conn)), collection, local_key))
    }

    /// Another adapter on the same database, scoped to a different collection.
    pub fn share(&self, collection: impl Into<String>, local_key: impl Into<String>) -> Self {
        Self::from_conn(Arc::clone(&self.conn), collection, local_key)
    }

    /// Name of the collection this adapter reads and writes.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn from_conn(
        conn: Arc<Mutex<Connection>>,
        collection: impl Into<String>,
        local_key: impl Into<String>,
    ) -> Self {
        let (connected, _) = watch::channel(true);
        Self {
            conn,
            collection: collection.into(),
            local_key: local_key.into(),
            connected,
        }
    }

    /// Run a blocking operation on the connection off the async runtime.
    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection, &str) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let collection = self.collection.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Transaction(format!("mutex poisoned: {}", e)))?;
            f(&mut conn, &collection)
        })
        .await
        .map_err(|e| StoreError::Transaction(format!("spawn_blocking failed: {}", e)))?
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

/// Advance the collection's key sequence and return the new key.
fn next_key(conn: &Connection, collection: &str) -> Result<StoreId> {
    conn.execute(
        "INSERT INTO key_sequences (collection, last_key) VALUES (?1, 1)
         ON CONFLICT(collection) DO UPDATE SET last_key = last_key + 1",
        params![collection],
    )?;
    let next: i64 = conn.query_row(
        "SELECT last_key FROM key_sequences WHERE collection = ?1",
        params![collection],
        |row| row.get(0),
    )?;
    Ok(StoreId(next as u64))
}

fn encode(value: &Value) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(bytes)
}

fn decode(bytes: &[u8]) -> Result<Value> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

#[async_trait]
impl LocalAdapter for SqliteAdapter {
    fn local_key(&self) -> &str {
        &self.local_key
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    async fn get_all_entries(&self) -> Result<Vec<Value>> {
        self.run(|conn, collection| {
            let bodies = conn
                .prepare("SELECT body FROM records WHERE collection = ?1 ORDER BY key")?
                .query_map(params![collection], |row| row.get::<_, Vec<u8>>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            bodies.iter().map(|body| decode(body)).collect()
        })
        .await
    }

    async fn get_entry(&self, key: StoreId) -> Result<Option<Value>> {
        self.run(move |conn, collection| {
            let body: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT body FROM records WHERE collection = ?1 AND key = ?2",
                    params![collection, key.get() as i64],
                    |row| row.get(0),
                )
                .optional()?;

            body.map(|b| decode(&b)).transpose()
        })
        .await
    }

    async fn put(&self, records: Vec<Value>) -> Result<Vec<PutResult>> {
        let keyed = records
            .into_iter()
            .map(|record| {
                if !record.is_object() {
                    return Err(StoreError::InvalidData("record is not an object".into()));
                }
                let key = self.key_of(&record)?;
                Ok((record, key))
            })
            .collect::<Result<Vec<_>>>()?;
        let local_key = self.local_key.clone();

        self.run(move |conn, collection| {
            let tx = conn.transaction()?;
            let mut results = Vec::with_capacity(keyed.len());

            for (mut record, key) in keyed {
                let key = match key {
                    Some(key) => {
                        tx.execute(
                            "INSERT INTO key_sequences (collection, last_key) VALUES (?1, ?2)
                             ON CONFLICT(collection)
                             DO UPDATE SET last_key = MAX(last_key, excluded.last_key)",
                            params![collection, key.get() as i64],
                        )?;
                        key
                    }
                    None => next_key(&tx, collection)?,
                };

                if let Value::Object(map) = &mut record {
                    map.insert(local_key.clone(), Value::from(key.get()));
                }

                tx.execute(
                    "INSERT INTO records (collection, key, body, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(collection, key)
                     DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
                    params![collection, key.get() as i64, encode(&record)?, now_millis()],
                )?;
                results.push(PutResult { key, record });
            }

            tx.commit()?;
            Ok(results)
        })
        .await
    }

    async fn remove(&self, record: &Value) -> Result<Value> {
        let key = self
            .key_of(record)?
            .ok_or_else(|| StoreError::InvalidData(format!("record has no {}", self.local_key)))?;
        let record = record.clone();

        self.run(move |conn, collection| {
            conn.execute(
                "DELETE FROM records WHERE collection = ?1 AND key = ?2",
                params![collection, key.get() as i64],
            )?;
            Ok(record)
        })
        .await
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<Value>> {
        let key = key.to_string();
        self.run(move |conn, collection| {
            let value: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT value FROM metadata WHERE collection = ?1 AND key = ?2",
                    params![collection, key],
                    |row| row.get(0),
                )
                .optional()?;

            value.map(|v| decode(&v)).transpose()
        })
        .await
    }

    async fn set_metadata(&self, key: &str, value: Value) -> Result<()> {
        let key = key.to_string();
        self.run(move |conn, collection| {
            conn.execute(
                "INSERT INTO metadata (collection, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(collection, key) DO UPDATE SET value = excluded.value",
                params![collection, key, encode(&value)?],
            )?;
            Ok(())
        })
        .await
    }
}
