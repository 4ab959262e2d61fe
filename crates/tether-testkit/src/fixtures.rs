//! Test fixtures and helpers.
//!
//! Common setup code for integration tests: a `lists`/`todos` engine with a
//! `lists.items` relationship, in-memory stores and an in-memory remote peer.

use std::sync::Arc;

use serde_json::Value;
use tether::{
    CollectionConfig, Engine, EngineError, EntityHandle, Envelope, RelationConfig, RtId,
};
use tether_store::MemoryAdapter;
use tether_sync::MemoryServer;

/// First keys handed out by the fixture's stores and remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixtureKeys {
    pub list_store: u64,
    pub list_server: u64,
    pub todo_store: u64,
    pub todo_server: u64,
}

impl Default for FixtureKeys {
    fn default() -> Self {
        Self {
            list_store: 201,
            list_server: 10,
            todo_store: 101,
            todo_server: 55,
        }
    }
}

/// An offline engine over in-memory stores and an in-memory remote peer.
pub struct EngineFixture {
    pub engine: Engine,
    pub server: Arc<MemoryServer>,
    pub lists: Arc<MemoryAdapter>,
    pub todos: Arc<MemoryAdapter>,
    pub memberships: Arc<MemoryAdapter>,
}

impl EngineFixture {
    /// Fixture with the default keys.
    pub async fn new() -> tether::Result<Self> {
        Self::with_keys(FixtureKeys::default()).await
    }

    /// Fixture whose stores and remote collections start at `keys`.
    pub async fn with_keys(keys: FixtureKeys) -> tether::Result<Self> {
        let server = Arc::new(
            MemoryServer::new()
                .with_collection_from("/lists", keys.list_server)
                .with_collection_from("/todos", keys.todo_server)
                .with_relation("/lists", "items"),
        );
        let lists = Arc::new(MemoryAdapter::new("_id").with_first_key(keys.list_store));
        let todos = Arc::new(MemoryAdapter::new("_id").with_first_key(keys.todo_store));
        let memberships = Arc::new(MemoryAdapter::new("_id"));

        let mut engine = Engine::new(server.clone());
        engine
            .add_collection(CollectionConfig::new("lists"), Some(lists.clone()))
            .await?;
        engine
            .add_collection(CollectionConfig::new("todos"), Some(todos.clone()))
            .await?;
        engine.add_relation(
            RelationConfig::new("lists", "items", "todos"),
            Some(memberships.clone()),
        )?;

        Ok(Self {
            engine,
            server,
            lists,
            todos,
            memberships,
        })
    }

    /// Submit a new entity and return its runtime id.
    pub async fn create(&mut self, collection: &str, data: Value) -> tether::Result<RtId> {
        let submission = self.engine.submit(collection, Envelope::save(data)).await?;
        submission.rt_id.ok_or_else(|| {
            EngineError::InvalidOperation(format!("{collection} rejected the new entity"))
        })
    }

    pub fn list(&self, rt_id: RtId) -> Option<&EntityHandle> {
        self.engine.collection("lists").ok()?.get(rt_id)
    }

    pub fn todo(&self, rt_id: RtId) -> Option<&EntityHandle> {
        self.engine.collection("todos").ok()?.get(rt_id)
    }
}
