//! # Tether Store
//!
//! Local-store adapter contract for Tether. The engine only ever talks to the
//! [`LocalAdapter`] trait; concrete backends are picked by configuration.
//!
//! ## Key Types
//!
//! - [`LocalAdapter`] - The async trait every storage backend implements
//! - [`MemoryAdapter`] - In-memory backend with a togglable connection, for tests
//! - [`SqliteAdapter`] - SQLite backend storing CBOR-encoded records
//! - [`PutResult`] - The key a record was written under
//!
//! ## Usage
//!
//! ```rust,no_run
//! use serde_json::json;
//! use tether_store::{LocalAdapter, LocalAdapterExt, SqliteAdapter};
//!
//! async fn example() {
//!     let store = SqliteAdapter::open("tether.db", "todos", "_id").unwrap();
//!
//!     let written = store.put_one(json!({"title": "milk"})).await.unwrap();
//!     let record = store.get_entry(written.key).await.unwrap();
//!     assert!(record.is_some());
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Keyed upserts**: a record that already carries its local key is written
//!   under that key; otherwise the backend assigns the next one.
//! - **Connectivity signal**: every backend publishes a `watch` channel the
//!   local sync channel uses to pause and resume its write queue.
//! - **Metadata**: arbitrary key/value pairs live beside the records.

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryAdapter;
pub use sqlite::SqliteAdapter;
pub use traits::{LocalAdapter, LocalAdapterExt, PutResult};
