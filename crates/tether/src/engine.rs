//! The engine: every collection and relationship set behind one handle.
//!
//! The engine owns one [`Collection`] per entity type and one
//! [`RelationshipSet`] per opened `(relation, parent)` pair. After every
//! operation it routes what a collection emitted downstream to the
//! relationship sets that care: members pass through their related type's
//! sets, and parents bind (or dispose) their own sets.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tether_core::{Action, Envelope, MemberRef, RtId, TransactionCounter, TransactionId};
use tether_store::LocalAdapter;
use tether_sync::{ErrorBus, ErrorEvent, Outcome, Transport};
use tokio::sync::{broadcast, oneshot};

use crate::collection::{Collection, Submission};
use crate::config::{CollectionConfig, EngineConfig, RelationConfig};
use crate::error::{EngineError, Result};
use crate::handle::EntityHandle;
use crate::relation::RelationshipSet;

/// Engine-wide connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

/// One opened relationship set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelationKey {
    /// Qualified relation name, `parent.name`.
    pub relation: String,
    pub parent_rt: RtId,
}

impl RelationKey {
    pub fn new(relation: impl Into<String>, parent_rt: RtId) -> Self {
        Self {
            relation: relation.into(),
            parent_rt,
        }
    }
}

struct RelationType {
    config: RelationConfig,
    adapter: Option<Arc<dyn LocalAdapter>>,
}

/// Reconciliation engine.
pub struct Engine {
    transport: Arc<dyn Transport>,
    collections: BTreeMap<String, Collection>,
    relation_types: BTreeMap<String, RelationType>,
    relations: BTreeMap<RelationKey, RelationshipSet>,
    transactions: TransactionCounter,
    errors: ErrorBus,
    connectivity: broadcast::Sender<Connectivity>,
    online: bool,
}

impl Engine {
    /// An empty, offline engine talking to `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (connectivity, _) = broadcast::channel(16);
        Self {
            transport,
            collections: BTreeMap::new(),
            relation_types: BTreeMap::new(),
            relations: BTreeMap::new(),
            transactions: TransactionCounter::new(),
            errors: ErrorBus::default(),
            connectivity,
            online: false,
        }
    }

    /// Build an engine from configuration.
    ///
    /// `open_store` is called once per locally persisted collection and once
    /// per relationship, with the collection name or the qualified relation
    /// name. Every collection is loaded; `start_online` connects afterwards.
    pub async fn from_config<F>(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        mut open_store: F,
    ) -> Result<Self>
    where
        F: FnMut(&str) -> anyhow::Result<Arc<dyn LocalAdapter>>,
    {
        config.validate()?;
        let mut engine = Self::new(transport);

        for collection in config.collections {
            let adapter = if collection.persist_locally {
                Some(open_store(&collection.name)?)
            } else {
                None
            };
            let name = collection.name.clone();
            engine.add_collection(collection, adapter).await?;
            engine.load(&name).await?;
        }
        for relation in config.relations {
            let adapter = open_store(&relation.qualified_name())?;
            engine.add_relation(relation, Some(adapter))?;
        }

        if config.start_online {
            engine.online().await?;
        }
        Ok(engine)
    }

    // ─── Setup ───

    /// Register an entity type.
    pub async fn add_collection(
        &mut self,
        config: CollectionConfig,
        adapter: Option<Arc<dyn LocalAdapter>>,
    ) -> Result<()> {
        if self.collections.contains_key(&config.name) {
            return Err(EngineError::Config(format!(
                "duplicate collection {}",
                config.name
            )));
        }
        let name = config.name.clone();
        let mut collection = Collection::new(
            config,
            adapter,
            self.transport.clone(),
            self.transactions.clone(),
            self.errors.clone(),
        );
        let emitted = if self.online {
            collection.set_connected(true).await?
        } else {
            Vec::new()
        };
        self.collections.insert(name.clone(), collection);
        self.dispatch(&name, &emitted).await;
        tracing::info!(collection = %name, "collection added");
        Ok(())
    }

    /// Register a relationship between two known entity types.
    pub fn add_relation(
        &mut self,
        config: RelationConfig,
        adapter: Option<Arc<dyn LocalAdapter>>,
    ) -> Result<()> {
        for side in [&config.parent, &config.related] {
            if !self.collections.contains_key(side) {
                return Err(EngineError::UnknownCollection(side.clone()));
            }
        }
        let name = config.qualified_name();
        if self.relation_types.contains_key(&name) {
            return Err(EngineError::Config(format!("duplicate relationship {name}")));
        }
        self.relation_types
            .insert(name, RelationType { config, adapter });
        Ok(())
    }

    // ─── Access ───

    pub fn collection(&self, name: &str) -> Result<&Collection> {
        self.collections
            .get(name)
            .ok_or_else(|| EngineError::UnknownCollection(name.to_string()))
    }

    fn collection_mut(&mut self, name: &str) -> Result<&mut Collection> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| EngineError::UnknownCollection(name.to_string()))
    }

    /// Names of every registered collection.
    pub fn collection_names(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    pub fn relation(&self, relation: &str, parent_rt: RtId) -> Result<&RelationshipSet> {
        self.relations
            .get(&RelationKey::new(relation, parent_rt))
            .ok_or_else(|| EngineError::UnknownRelation(format!("{relation}[{parent_rt}]")))
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    /// The global error stream.
    pub fn errors(&self) -> broadcast::Receiver<ErrorEvent> {
        self.errors.subscribe()
    }

    /// Connectivity changes from now on.
    pub fn connectivity(&self) -> broadcast::Receiver<Connectivity> {
        self.connectivity.subscribe()
    }

    /// Downstream envelopes of one collection.
    pub fn subscribe(&self, collection: &str) -> Result<broadcast::Receiver<Envelope>> {
        Ok(self.collection(collection)?.subscribe())
    }

    // ─── Collection Operations ───

    /// Submit an external change to a collection.
    pub async fn submit(&mut self, collection: &str, envelope: Envelope) -> Result<Submission> {
        let submission = self.collection_mut(collection)?.submit(envelope).await?;
        self.dispatch(collection, &submission.emitted).await;
        Ok(submission)
    }

    /// Submit an external change and wait on its outcome separately.
    pub async fn submit_and_track(
        &mut self,
        collection: &str,
        envelope: Envelope,
    ) -> Result<(Submission, oneshot::Receiver<Outcome>)> {
        let (submission, waiter) = self
            .collection_mut(collection)?
            .submit_and_track(envelope)
            .await?;
        self.dispatch(collection, &submission.emitted).await;
        Ok((submission, waiter))
    }

    /// Be told how a transaction of `collection` ends.
    pub fn wait_for(
        &mut self,
        collection: &str,
        transaction_id: TransactionId,
    ) -> Result<oneshot::Receiver<Outcome>> {
        Ok(self.collection_mut(collection)?.wait_for(transaction_id))
    }

    /// Fetch one collection from the remote peer.
    pub async fn fetch(&mut self, collection: &str) -> Result<Vec<Envelope>> {
        let emitted = self.collection_mut(collection)?.fetch().await?;
        self.dispatch(collection, &emitted).await;
        Ok(emitted)
    }

    /// Load one collection from its local store.
    pub async fn load(&mut self, collection: &str) -> Result<Vec<Envelope>> {
        let emitted = self.collection_mut(collection)?.load().await?;
        self.dispatch(collection, &emitted).await;
        Ok(emitted)
    }

    /// Flush writes buffered while local stores were unavailable.
    ///
    /// Every collection and relationship operation already does this first;
    /// call it when a store comes back and nothing else is submitted.
    pub async fn resume_storage(&mut self) -> Result<()> {
        let names: Vec<String> = self.collections.keys().cloned().collect();
        for name in names {
            let emitted = self.collection_mut(&name)?.resume_storage().await?;
            self.dispatch(&name, &emitted).await;
        }
        for set in self.relations.values_mut() {
            set.resume_storage().await;
        }
        Ok(())
    }

    // ─── Connectivity ───

    /// Connect every remote channel and replay their offline queues.
    pub async fn online(&mut self) -> Result<()> {
        self.set_online(true).await
    }

    /// Disconnect every remote channel.
    pub async fn offline(&mut self) -> Result<()> {
        self.set_online(false).await
    }

    async fn set_online(&mut self, online: bool) -> Result<()> {
        self.online = online;
        let state = if online {
            Connectivity::Online
        } else {
            Connectivity::Offline
        };
        let _ = self.connectivity.send(state);
        tracing::info!(?state, "connectivity changed");

        let names: Vec<String> = self.collections.keys().cloned().collect();
        for name in names {
            let emitted = self.collection_mut(&name)?.set_connected(online).await?;
            self.dispatch(&name, &emitted).await;
        }
        for set in self.relations.values_mut() {
            set.set_online(online).await?;
        }
        Ok(())
    }

    // ─── Relationships ───

    /// Open the relationship set of one parent entity.
    ///
    /// Opening an already open set does nothing.
    pub async fn open_relation(&mut self, relation: &str, parent_rt: RtId) -> Result<()> {
        let key = RelationKey::new(relation, parent_rt);
        if self.relations.contains_key(&key) {
            return Ok(());
        }
        let relation_type = self
            .relation_types
            .get(relation)
            .ok_or_else(|| EngineError::UnknownRelation(relation.to_string()))?;
        let parent = self.collection(&relation_type.config.parent)?;
        let parent_meta = parent
            .get(parent_rt)
            .ok_or_else(|| EngineError::UnknownEntity {
                collection: parent.name().to_string(),
                rt_id: parent_rt,
            })?
            .meta()
            .clone();

        let mut set = RelationshipSet::new(
            relation_type.config.clone(),
            &parent_meta,
            &parent.config().route,
            relation_type.adapter.clone(),
            self.transport.clone(),
            self.transactions.clone(),
            self.errors.clone(),
        )?;
        set.open(self.online).await?;
        self.relations.insert(key, set);
        Ok(())
    }

    /// Add `member_rt` of the related type to a parent's relationship set.
    pub async fn relate(&mut self, relation: &str, parent_rt: RtId, member_rt: RtId) -> Result<()> {
        self.open_relation(relation, parent_rt).await?;
        let member = self.member_meta(relation, member_rt)?;
        self.relation_mut(relation, parent_rt)?.add(&member).await
    }

    /// Remove `member_rt` from a parent's relationship set.
    pub async fn unrelate(&mut self, relation: &str, parent_rt: RtId, member_rt: RtId) -> Result<()> {
        self.open_relation(relation, parent_rt).await?;
        let member = self.member_meta(relation, member_rt)?;
        self.relation_mut(relation, parent_rt)?.remove(&member).await
    }

    /// Fetch one relationship set's remote membership.
    pub async fn fetch_relation(&mut self, relation: &str, parent_rt: RtId) -> Result<()> {
        self.relation_mut(relation, parent_rt)?.fetch().await
    }

    /// Current members of a parent's relationship set, each exactly once.
    ///
    /// Members the related collection does not know (yet) are skipped.
    pub fn members(&self, relation: &str, parent_rt: RtId) -> Result<Vec<&EntityHandle>> {
        let set = self.relation(relation, parent_rt)?;
        let related = self.collection(&set.config().related)?;

        let mut seen = BTreeSet::new();
        let mut members = Vec::new();
        for member in set.members() {
            let handle = match &member {
                MemberRef::Server(server_id) => related.get_by_server_id(server_id),
                MemberRef::Store(store_id) => related.get_by_store_id(*store_id),
            };
            if let Some(handle) = handle {
                if handle.rt_id().is_some_and(|rt_id| seen.insert(rt_id)) {
                    members.push(handle);
                }
            }
        }
        Ok(members)
    }

    fn relation_mut(&mut self, relation: &str, parent_rt: RtId) -> Result<&mut RelationshipSet> {
        self.relations
            .get_mut(&RelationKey::new(relation, parent_rt))
            .ok_or_else(|| EngineError::UnknownRelation(format!("{relation}[{parent_rt}]")))
    }

    fn member_meta(&self, relation: &str, member_rt: RtId) -> Result<tether_core::Meta> {
        let relation_type = self
            .relation_types
            .get(relation)
            .ok_or_else(|| EngineError::UnknownRelation(relation.to_string()))?;
        let related = self.collection(&relation_type.config.related)?;
        related
            .get(member_rt)
            .map(|handle| handle.meta().clone())
            .ok_or_else(|| EngineError::UnknownEntity {
                collection: related.name().to_string(),
                rt_id: member_rt,
            })
    }

    // ─── Routing ───

    /// Route one collection's downstream output to the relationship sets.
    async fn dispatch(&mut self, collection: &str, emitted: &[Envelope]) {
        if emitted.is_empty() || self.relations.is_empty() {
            return;
        }
        for envelope in emitted {
            let mut disposed = Vec::new();
            for (key, set) in self.relations.iter_mut() {
                if set.config().related == collection {
                    if let Err(e) = set.observe(envelope).await {
                        tracing::warn!(relation = %key.relation, error = %e, "member update failed");
                    }
                }
                if set.config().parent != collection || envelope.rt_id() != Some(key.parent_rt) {
                    continue;
                }
                if matches!(envelope.action(), Some(Action::DeletePermanently)) {
                    disposed.push(key.clone());
                    continue;
                }
                if let Some(store_id) = envelope.store_id() {
                    if let Err(e) = set.bind_parent_store(store_id).await {
                        tracing::warn!(relation = %key.relation, error = %e, "cannot persist membership");
                    }
                }
                if let Some(server_id) = envelope.server_id() {
                    if let Err(e) = set.bind_parent(server_id.clone()).await {
                        tracing::warn!(relation = %key.relation, error = %e, "cannot bind relationship");
                    }
                }
            }
            for key in disposed {
                if let Some(set) = self.relations.remove(&key) {
                    set.discard().await;
                    tracing::debug!(relation = %key.relation, parent = %key.parent_rt, "relationship set disposed");
                }
            }
        }
    }
}
