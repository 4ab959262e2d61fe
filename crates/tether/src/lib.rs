//! # Tether
//!
//! Offline-first entity reconciliation: keep one canonical in-memory record
//! per entity while changes arrive from callers, a local store and a remote
//! peer, each of which knows the entity under a different key.
//!
//! ## Overview
//!
//! - **Registry**: Reconciles every envelope against known entities by
//!   runtime id, server id or store id, and decides where it goes next
//! - **Entity Handle**: The canonical record of one entity
//! - **Local Channel**: Writes to the local store and pauses while it is away
//! - **Remote Channel**: Pushes to the remote peer, queues while offline
//! - **Relationship Set**: Membership of related entities in one parent
//!
//! ## Key Concepts
//!
//! - **rtId**: Assigned once per entity by the registry, never changes.
//! - **Fill missing, never overwrite**: An id the registry already knows for
//!   an entity is never replaced by a different one.
//! - **Soft delete**: A deletion the remote peer has not confirmed yet.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tether::{CollectionConfig, Engine, Envelope};
//! use tether::store::MemoryAdapter;
//! use tether::sync::MemoryServer;
//!
//! async fn example() -> tether::Result<()> {
//!     let server = Arc::new(MemoryServer::new().with_collection("/todos"));
//!     let mut engine = Engine::new(server);
//!     engine
//!         .add_collection(
//!             CollectionConfig::new("todos"),
//!             Some(Arc::new(MemoryAdapter::new("_id"))),
//!         )
//!         .await?;
//!
//!     let submission = engine
//!         .submit("todos", Envelope::save(json!({"title": "milk"})))
//!         .await?;
//!     engine.online().await?;
//!
//!     let todo = engine.collection("todos")?.get(submission.rt_id.unwrap());
//!     assert!(todo.unwrap().meta().server_id.is_some());
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `tether::core` - Envelopes, ids and the merge rule
//! - `tether::store` - Local store adapters
//! - `tether::sync` - Remote channel, protocols and transports

pub mod collection;
pub mod config;
pub mod engine;
pub mod error;
pub mod handle;
pub mod local;
pub mod registry;
pub mod relation;

// Re-export component crates
pub use tether_core as core;
pub use tether_store as store;
pub use tether_sync as sync;

// Re-export main types for convenience
pub use collection::{Collection, Submission};
pub use config::{CollectionConfig, EngineConfig, RelationConfig};
pub use engine::{Connectivity, Engine, RelationKey};
pub use error::{EngineError, Result};
pub use handle::{EntityHandle, HandleState, Transition};
pub use local::LocalChannel;
pub use registry::{Registry, Routed, Source};
pub use relation::RelationshipSet;

// Re-export commonly used core types
pub use tether_core::{Action, Envelope, Meta, RtId, ServerId, StoreId, TransactionId};
pub use tether_sync::{ErrorEvent, Outcome};
