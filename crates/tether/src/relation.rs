//! Relationship sets: membership of related entities in one parent entity.
//!
//! A set keeps three disjoint lists (see [`RelationRecord`]), persists the
//! whole triple under the parent's store id after every change, and talks to
//! the remote membership list at `{parent route}/{parent serverId}/{name}`.
//!
//! ## Binding
//!
//! The remote list cannot be addressed until the parent has a server id.
//! Until then the relation channel stays disconnected and announcements wait
//! in its offline queue, keyed by the member's runtime id. Binding the parent
//! connects the channel (when online) and replays them.
//!
//! ## Promotion
//!
//! A member staged by store id is promoted the first time the related
//! entity shows up with a server id: the id moves to the server list, the
//! triple is persisted, then the member is announced.

use std::sync::Arc;

use serde_json::Value;
use tether_core::{
    Action, Envelope, Meta, MemberRef, RecordKeys, RelationRecord, RtId, ServerId, StoreId,
    TransactionCounter,
};
use tether_store::LocalAdapter;
use tether_sync::{ErrorBus, HttpRelationProtocol, RemoteChannel, Transport};
use tokio::sync::{broadcast, watch};

use crate::config::RelationConfig;
use crate::error::{EngineError, Result};
use crate::local::LocalChannel;

const DOWNSTREAM_CAPACITY: usize = 256;

/// Membership of one parent entity in one relationship.
pub struct RelationshipSet {
    config: RelationConfig,
    parent_rt: RtId,
    parent_store: Option<StoreId>,
    record: RelationRecord,
    local: Option<LocalChannel>,
    remote: RemoteChannel,
    scope: watch::Sender<Option<ServerId>>,
    downstream: broadcast::Sender<Envelope>,
    online: bool,
}

impl RelationshipSet {
    /// Create a set for the parent described by `parent`.
    ///
    /// `parent_route` is the parent collection's route.
    pub fn new(
        config: RelationConfig,
        parent: &Meta,
        parent_route: &str,
        adapter: Option<Arc<dyn LocalAdapter>>,
        transport: Arc<dyn Transport>,
        transactions: TransactionCounter,
        errors: ErrorBus,
    ) -> Result<Self> {
        let parent_rt = parent.rt_id.ok_or_else(|| {
            EngineError::InvalidOperation("relationship parent has no runtime id".into())
        })?;
        let name = format!("{}[{}]", config.qualified_name(), parent_rt);

        let (scope, scope_rx) = watch::channel(parent.server_id.clone());
        let protocol = HttpRelationProtocol::new(transport, parent_route, config.name.clone(), scope_rx)
            .with_headers(config.headers.clone());
        let local = adapter.map(|adapter| {
            LocalChannel::new(
                name.clone(),
                adapter,
                RecordKeys::new(config.local_key.clone(), "id"),
                errors.clone(),
            )
        });
        let (downstream, _) = broadcast::channel(DOWNSTREAM_CAPACITY);

        Ok(Self {
            remote: RemoteChannel::new(name, Box::new(protocol), transactions, errors),
            parent_rt,
            parent_store: parent.store_id,
            record: RelationRecord::new(),
            local,
            scope,
            downstream,
            online: false,
            config,
        })
    }

    pub fn config(&self) -> &RelationConfig {
        &self.config
    }

    pub fn parent_rt(&self) -> RtId {
        self.parent_rt
    }

    pub fn record(&self) -> &RelationRecord {
        &self.record
    }

    pub fn remote(&self) -> &RemoteChannel {
        &self.remote
    }

    /// Whether the parent's server id is known.
    pub fn is_bound(&self) -> bool {
        self.scope.borrow().is_some()
    }

    /// Every current member exactly once.
    pub fn members(&self) -> Vec<MemberRef> {
        self.record.members()
    }

    /// Receive every member envelope that passes through [`Self::observe`].
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.downstream.subscribe()
    }

    // ─── Lifecycle ───

    /// Load the persisted membership, connect if possible and fetch.
    pub async fn open(&mut self, online: bool) -> Result<()> {
        self.load().await?;
        self.set_online(online).await?;
        if self.remote.is_connected() {
            if let Err(e) = self.fetch().await {
                tracing::warn!(relation = %self.remote.name(), error = %e, "initial fetch failed");
            }
        }
        Ok(())
    }

    async fn load(&mut self) -> Result<()> {
        let (Some(local), Some(parent)) = (&self.local, self.parent_store) else {
            return Ok(());
        };
        if let Some(envelope) = local.get(parent).await? {
            self.record = RelationRecord::from_data(envelope.data)?;
            tracing::debug!(relation = %self.remote.name(), members = self.record.len(), "loaded membership");
        }
        Ok(())
    }

    /// Follow engine connectivity. The channel only connects once bound.
    pub async fn set_online(&mut self, online: bool) -> Result<()> {
        self.online = online;
        let connect = online && self.is_bound();
        if connect == self.remote.is_connected() {
            return Ok(());
        }
        let replies = self.remote.set_connected(connect).await;
        self.handle_replies(replies).await
    }

    /// Record the parent's server id. Connects and replays when online.
    pub async fn bind_parent(&mut self, server_id: ServerId) -> Result<()> {
        if self.scope.borrow().as_ref() == Some(&server_id) {
            return Ok(());
        }
        tracing::debug!(relation = %self.remote.name(), %server_id, "parent bound");
        self.scope.send_replace(Some(server_id));
        self.set_online(self.online).await
    }

    /// Record the parent's store id and persist anything staged before it.
    pub async fn bind_parent_store(&mut self, store_id: StoreId) -> Result<()> {
        if self.parent_store == Some(store_id) {
            return Ok(());
        }
        self.parent_store = Some(store_id);
        if self.record.is_empty() && self.record.deleted_items.is_empty() {
            return Ok(());
        }
        self.persist().await
    }

    /// Remove the persisted membership; the parent is gone.
    pub async fn discard(mut self) {
        let (Some(local), Some(parent)) = (self.local.as_mut(), self.parent_store) else {
            return;
        };
        let envelope = Envelope::new(Value::Null)
            .with_action(Action::DeletePermanently)
            .with_store_id(parent);
        local.flush().await;
        local.submit(envelope).await;
        tracing::debug!(relation = %self.remote.name(), "membership discarded");
    }

    // ─── Membership ───

    /// Add a related entity.
    pub async fn add(&mut self, member: &Meta) -> Result<()> {
        match (&member.server_id, member.store_id) {
            (Some(server_id), _) => {
                if self.record.insert_server(server_id.clone()) {
                    if let Some(store_id) = member.store_id {
                        self.record.drop_store(store_id);
                    }
                    self.persist().await?;
                }
                self.announce(member, Action::Save).await
            }
            (None, Some(store_id)) => {
                if self.record.stage_store(store_id) {
                    self.persist().await?;
                }
                Ok(())
            }
            (None, None) => Err(EngineError::InvalidOperation(format!(
                "{}: member has neither a server id nor a store id",
                self.config.qualified_name()
            ))),
        }
    }

    /// Remove a related entity.
    ///
    /// A server member stays pending until the remote peer confirms.
    pub async fn remove(&mut self, member: &Meta) -> Result<()> {
        if let Some(server_id) = &member.server_id {
            if self.record.mark_removed(server_id) {
                self.persist().await?;
                return self.announce(member, Action::Delete).await;
            }
        }
        if let Some(store_id) = member.store_id {
            if self.record.drop_store(store_id) {
                self.persist().await?;
            }
        }
        Ok(())
    }

    /// Look at one downstream envelope of the related collection.
    ///
    /// Members pass through to this set's subscribers; a staged member that
    /// now has a server id is promoted on the way.
    pub async fn observe(&mut self, envelope: &Envelope) -> Result<bool> {
        if matches!(envelope.action(), Some(Action::DeletePermanently)) {
            let by_store = envelope
                .store_id()
                .is_some_and(|store_id| self.record.drop_store(store_id));
            let by_server = envelope
                .server_id()
                .is_some_and(|server_id| self.record.drop_server(server_id));
            if by_store || by_server {
                tracing::debug!(relation = %self.remote.name(), "deleted member dropped");
                self.persist().await?;
            }
            return Ok(false);
        }

        let by_store = envelope
            .store_id()
            .is_some_and(|store_id| self.record.contains_store(store_id));
        let by_server = envelope
            .server_id()
            .is_some_and(|server_id| self.record.contains_server(server_id));
        if !by_store && !by_server {
            return Ok(false);
        }

        if let (true, Some(store_id), Some(server_id)) =
            (by_store, envelope.store_id(), envelope.server_id())
        {
            if self.record.promote(store_id, server_id.clone()) {
                tracing::debug!(relation = %self.remote.name(), %store_id, %server_id, "member promoted");
                self.persist().await?;
                self.announce(&envelope.meta, Action::Save).await?;
            }
        }

        let _ = self.downstream.send(envelope.clone());
        Ok(true)
    }

    /// Fetch the remote membership list and merge it in.
    pub async fn fetch(&mut self) -> Result<()> {
        let outcome = self.remote.fetch(None).await?;
        let fetched: Vec<ServerId> = outcome
            .envelopes
            .iter()
            .filter_map(|envelope| envelope.server_id().cloned())
            .collect();
        if self.record.merge_remote(&fetched) {
            self.persist().await?;
        }
        Ok(())
    }

    /// Flush membership writes buffered while the local store was away.
    pub async fn resume_storage(&mut self) {
        if let Some(local) = self.local.as_mut() {
            local.flush().await;
        }
    }

    // ─── Internals ───

    async fn announce(&mut self, member: &Meta, action: Action) -> Result<()> {
        let Some(server_id) = member.server_id.clone() else {
            return Ok(());
        };
        let mut envelope = Envelope::new(Value::Null)
            .with_action(action)
            .with_server_id(server_id);
        envelope.meta.rt_id = member.rt_id;

        if let Some(reply) = self.remote.submit(envelope).await? {
            self.handle_reply(&reply).await?;
        }
        Ok(())
    }

    async fn handle_replies(&mut self, replies: Vec<Envelope>) -> Result<()> {
        for reply in &replies {
            self.handle_reply(reply).await?;
        }
        Ok(())
    }

    async fn handle_reply(&mut self, reply: &Envelope) -> Result<()> {
        if !matches!(reply.action(), Some(Action::DeletePermanently)) {
            return Ok(());
        }
        if let Some(server_id) = reply.server_id() {
            if self.record.confirm_removed(server_id) {
                self.persist().await?;
            }
        }
        Ok(())
    }

    async fn persist(&mut self) -> Result<()> {
        let (Some(local), Some(parent)) = (self.local.as_mut(), self.parent_store) else {
            return Ok(());
        };
        let envelope = self.record.to_envelope(parent)?;
        local.flush().await;
        local.submit(envelope).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_store::MemoryAdapter;
    use tether_sync::{MemoryServer, Method};

    fn parent(server: Option<u64>) -> Meta {
        let mut envelope = Envelope::save(json!({}))
            .with_rt_id(RtId(1))
            .with_store_id(StoreId(7));
        if let Some(id) = server {
            envelope = envelope.with_server_id(id);
        }
        envelope.meta
    }

    fn member(rt: u64, store: Option<u64>, server: Option<u64>) -> Meta {
        let mut envelope = Envelope::save(json!({})).with_rt_id(RtId(rt));
        if let Some(id) = store {
            envelope = envelope.with_store_id(StoreId(id));
        }
        if let Some(id) = server {
            envelope = envelope.with_server_id(id);
        }
        envelope.meta
    }

    fn set(
        parent: &Meta,
        server: &Arc<MemoryServer>,
        adapter: &Arc<MemoryAdapter>,
    ) -> RelationshipSet {
        RelationshipSet::new(
            RelationConfig::new("lists", "items", "todos"),
            parent,
            "/lists",
            Some(adapter.clone()),
            server.clone(),
            TransactionCounter::new(),
            ErrorBus::default(),
        )
        .unwrap()
    }

    fn server() -> Arc<MemoryServer> {
        Arc::new(MemoryServer::new().with_relation("/lists", "items"))
    }

    #[tokio::test]
    async fn test_add_server_member_announces_and_persists() {
        let server = server();
        let adapter = Arc::new(MemoryAdapter::new("_id"));
        let mut set = set(&parent(Some(3)), &server, &adapter);
        set.open(true).await.unwrap();

        set.add(&member(2, Some(60), Some(500))).await.unwrap();

        assert_eq!(set.record().server_items, vec![ServerId::from(500u64)]);
        assert_eq!(server.members("/lists", "3", "items").await, vec!["500".to_string()]);
        let stored = adapter.peek(StoreId(7)).unwrap();
        assert_eq!(stored["serverItems"], json!([500]));
    }

    #[tokio::test]
    async fn test_promotion_happens_once_and_announces_once() {
        let server = server();
        let adapter = Arc::new(MemoryAdapter::new("_id"));
        let mut set = set(&parent(Some(3)), &server, &adapter);
        set.open(true).await.unwrap();

        set.add(&member(2, Some(60), None)).await.unwrap();
        assert_eq!(set.record().store_items, vec![StoreId(60)]);
        assert_eq!(server.count(Method::Put).await, 0);

        let synced = Envelope::save(json!({}))
            .with_rt_id(RtId(2))
            .with_store_id(StoreId(60))
            .with_server_id(500u64);
        assert!(set.observe(&synced).await.unwrap());
        assert!(set.observe(&synced).await.unwrap());

        assert!(set.record().store_items.is_empty());
        assert_eq!(set.record().server_items, vec![ServerId::from(500u64)]);
        assert_eq!(server.count(Method::Put).await, 1);
    }

    #[tokio::test]
    async fn test_unbound_parent_queues_until_bound() {
        let server = server();
        let adapter = Arc::new(MemoryAdapter::new("_id"));
        let mut set = set(&parent(None), &server, &adapter);
        set.open(true).await.unwrap();
        assert!(!set.remote().is_connected());

        set.add(&member(2, None, Some(500))).await.unwrap();
        assert_eq!(set.remote().queue().len(), 1);

        set.bind_parent(ServerId::from(3u64)).await.unwrap();
        assert!(set.remote().is_connected());
        assert!(set.remote().queue().is_empty());
        assert_eq!(server.members("/lists", "3", "items").await, vec!["500".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_waits_for_confirmation() {
        let server = server();
        let adapter = Arc::new(MemoryAdapter::new("_id"));
        let mut set = set(&parent(Some(3)), &server, &adapter);
        set.open(true).await.unwrap();

        let todo = member(2, Some(60), Some(500));
        set.add(&todo).await.unwrap();
        set.set_online(false).await.unwrap();
        set.remove(&todo).await.unwrap();
        assert!(set.record().is_pending_removal(&ServerId::from(500u64)));
        assert!(set.members().is_empty());
        assert_eq!(adapter.peek(StoreId(7)).unwrap()["deletedItems"], json!([500]));

        set.set_online(true).await.unwrap();
        assert!(set.record().deleted_items.is_empty());
        assert_eq!(server.count(Method::Delete).await, 1);
        assert!(server.members("/lists", "3", "items").await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_staged_member_drops_it() {
        let server = server();
        let adapter = Arc::new(MemoryAdapter::new("_id"));
        let mut set = set(&parent(Some(3)), &server, &adapter);

        let todo = member(2, Some(60), None);
        set.add(&todo).await.unwrap();
        set.remove(&todo).await.unwrap();

        assert!(set.record().is_empty());
        assert!(server.requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_reopen_loads_persisted_membership() {
        let server = server();
        let adapter = Arc::new(MemoryAdapter::new("_id"));
        let mut first = set(&parent(Some(3)), &server, &adapter);
        first.add(&member(2, Some(60), None)).await.unwrap();
        first.add(&member(4, None, Some(8))).await.unwrap();

        let mut second = set(&parent(Some(3)), &server, &adapter);
        second.open(false).await.unwrap();
        assert_eq!(
            second.members(),
            vec![MemberRef::Server(ServerId::from(8u64)), MemberRef::Store(StoreId(60))]
        );
    }

    #[tokio::test]
    async fn test_fetch_merges_remote_members() {
        let server = server();
        let adapter = Arc::new(MemoryAdapter::new("_id"));
        let mut seeding = set(&parent(Some(3)), &server, &adapter);
        seeding.open(true).await.unwrap();
        seeding.add(&member(2, None, Some(11))).await.unwrap();

        let mut set = set(&parent(Some(3)), &server, &Arc::new(MemoryAdapter::new("_id")));
        set.open(true).await.unwrap();
        assert_eq!(set.record().server_items, vec![ServerId::from(11u64)]);
    }

    #[tokio::test]
    async fn test_observe_ignores_non_members() {
        let server = server();
        let adapter = Arc::new(MemoryAdapter::new("_id"));
        let mut set = set(&parent(Some(3)), &server, &adapter);
        let mut downstream = set.subscribe();

        let stranger = Envelope::save(json!({})).with_server_id(99u64);
        assert!(!set.observe(&stranger).await.unwrap());
        assert!(downstream.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deleted_server_member_leaves_the_set() {
        let server = server();
        let adapter = Arc::new(MemoryAdapter::new("_id"));
        let mut set = set(&parent(Some(3)), &server, &adapter);
        set.open(true).await.unwrap();
        set.add(&member(2, Some(60), Some(500))).await.unwrap();
        set.add(&member(4, None, Some(501))).await.unwrap();

        let gone = Envelope::new(Value::Null)
            .with_action(Action::DeletePermanently)
            .with_rt_id(RtId(2))
            .with_store_id(StoreId(60))
            .with_server_id(500u64);
        assert!(!set.observe(&gone).await.unwrap());

        assert_eq!(set.members(), vec![MemberRef::Server(ServerId::from(501u64))]);
        assert_eq!(adapter.peek(StoreId(7)).unwrap()["serverItems"], json!([501]));
    }

    #[tokio::test]
    async fn test_membership_written_after_store_returns() {
        let server = server();
        let adapter = Arc::new(MemoryAdapter::new("_id"));
        let mut set = set(&parent(Some(3)), &server, &adapter);
        adapter.set_connected(false);
        set.add(&member(2, Some(60), None)).await.unwrap();
        assert!(adapter.peek(StoreId(7)).is_none());

        adapter.set_connected(true);
        set.add(&member(4, Some(61), None)).await.unwrap();
        assert_eq!(adapter.peek(StoreId(7)).unwrap()["storeItems"], json!([60, 61]));
    }

    #[tokio::test]
    async fn test_discard_removes_record() {
        let server = server();
        let adapter = Arc::new(MemoryAdapter::new("_id"));
        let mut set = set(&parent(Some(3)), &server, &adapter);
        set.add(&member(2, Some(60), None)).await.unwrap();
        assert!(adapter.peek(StoreId(7)).is_some());

        set.discard().await;
        assert!(adapter.peek(StoreId(7)).is_none());
    }
}
