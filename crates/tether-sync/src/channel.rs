//! Remote sync channel.
//!
//! One channel per collection or relationship. It owns the connection flag,
//! the offline queue and the transaction waiters, and delegates the wire work
//! to a [`RemoteProtocol`].
//!
//! ## Key Behaviour
//!
//! - Every submitted envelope is stamped with a transaction id.
//! - Disconnected: the envelope is queued under its runtime id, replacing any
//!   pending one. Waiters of the replaced envelope follow the new transaction.
//! - Connected: the envelope is pushed at once. A failure is published on the
//!   [`ErrorBus`] and rejects waiters; retryable failures go back to the queue.
//! - Reconnecting replays a snapshot of the queue in first-queued order.

use tether_core::{Action, Envelope, RtId, TransactionCounter, TransactionId};
use tokio::sync::oneshot;

use crate::bus::{ErrorBus, ErrorEvent};
use crate::error::{Result, SyncError};
use crate::protocol::{FetchOutcome, ProtocolKind, RemoteProtocol};
use crate::queue::OfflineQueue;
use crate::waiter::{Outcome, Waiters};

/// Connection manager for one remote collection.
pub struct RemoteChannel {
    name: String,
    protocol: Box<dyn RemoteProtocol>,
    connected: bool,
    queue: OfflineQueue,
    transactions: TransactionCounter,
    errors: ErrorBus,
    waiters: Waiters,
}

impl RemoteChannel {
    /// Create a disconnected channel.
    ///
    /// `transactions` and `errors` are shared with every other channel of the
    /// engine so transaction ids are globally monotonic.
    pub fn new(
        name: impl Into<String>,
        protocol: Box<dyn RemoteProtocol>,
        transactions: TransactionCounter,
        errors: ErrorBus,
    ) -> Self {
        Self {
            name: name.into(),
            protocol,
            connected: false,
            queue: OfflineQueue::new(),
            transactions,
            errors,
            waiters: Waiters::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ProtocolKind {
        self.protocol.kind()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Pending envelopes, oldest first.
    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    /// Assign a transaction id unless the envelope already has one.
    pub fn stamp(&self, envelope: &mut Envelope) -> TransactionId {
        *envelope
            .meta
            .transaction_id
            .get_or_insert_with(|| self.transactions.next())
    }

    /// Be told when `transaction_id` succeeds or fails.
    pub fn wait_for(&mut self, transaction_id: TransactionId) -> oneshot::Receiver<Outcome> {
        self.waiters.register(transaction_id)
    }

    /// Settle a transaction that never reached this channel.
    pub fn settle(&mut self, transaction_id: TransactionId, outcome: Outcome) {
        self.waiters.settle(transaction_id, outcome);
    }

    // ─── Push ───

    /// Queue or push one envelope.
    ///
    /// Returns the decoded reply when the push happened and succeeded. Remote
    /// failures are published, not returned; the only error is an envelope
    /// that cannot be queued because it has no runtime id.
    pub async fn submit(&mut self, mut envelope: Envelope) -> Result<Option<Envelope>> {
        self.stamp(&mut envelope);
        if !self.connected {
            self.enqueue(envelope)?;
            return Ok(None);
        }
        self.supersede(&envelope);
        Ok(self.push(envelope).await)
    }

    /// Drop a pending envelope that `envelope` replaces.
    ///
    /// A failed push can leave an envelope queued while the channel stays
    /// connected; a newer one for the same entity makes it stale. Function
    /// calls replace nothing.
    fn supersede(&mut self, envelope: &Envelope) {
        if matches!(envelope.action(), Some(Action::Function { .. })) {
            return;
        }
        let Some(rt_id) = envelope.rt_id() else {
            return;
        };
        if let Some(stale) = self.queue.remove(rt_id) {
            tracing::debug!(channel = %self.name, %rt_id, "pushing over a pending envelope");
            if let (Some(old), Some(new)) = (stale.meta.transaction_id, envelope.meta.transaction_id) {
                self.waiters.follow(old, new);
            }
        }
    }

    /// Update every pending envelope in place before it is replayed.
    pub fn refresh_pending(&mut self, mut refresh: impl FnMut(&mut Envelope)) {
        for envelope in self.queue.envelopes_mut() {
            refresh(envelope);
        }
    }

    /// Drop the pending envelope of an entity that no longer exists.
    pub fn forget(&mut self, rt_id: RtId) -> Option<Envelope> {
        let dropped = self.queue.remove(rt_id)?;
        tracing::debug!(channel = %self.name, %rt_id, "dropped pending envelope of disposed entity");
        Some(dropped)
    }

    fn enqueue(&mut self, envelope: Envelope) -> Result<()> {
        let rt_id = envelope.rt_id().ok_or_else(|| {
            SyncError::InvalidOperation(format!(
                "{}: cannot queue an envelope without a runtime id",
                self.name
            ))
        })?;
        let incoming = envelope.meta.transaction_id;

        if let Some(replaced) = self.queue.insert(rt_id, envelope) {
            tracing::debug!(channel = %self.name, %rt_id, "replaced pending envelope");
            if let (Some(old), Some(new)) = (replaced.meta.transaction_id, incoming) {
                self.waiters.follow(old, new);
            }
        } else {
            tracing::debug!(channel = %self.name, %rt_id, pending = self.queue.len(), "queued envelope");
        }
        Ok(())
    }

    async fn push(&mut self, envelope: Envelope) -> Option<Envelope> {
        match self.protocol.push(&envelope).await {
            Ok(reply) => {
                self.waiters.resolve(&reply);
                Some(reply)
            }
            Err(e) => {
                let event = ErrorEvent::new(
                    self.name.clone(),
                    envelope.meta.transaction_id,
                    envelope.rt_id(),
                    e.to_string(),
                );
                self.errors.publish(event.clone());
                self.waiters.reject(&event);

                if e.is_retryable() {
                    match envelope.rt_id() {
                        Some(rt_id) if self.queue.get(rt_id).is_none() => {
                            self.queue.insert(rt_id, envelope);
                        }
                        Some(rt_id) => {
                            tracing::debug!(channel = %self.name, %rt_id, "newer envelope already pending");
                        }
                        None => {
                            tracing::warn!(channel = %self.name, "dropping failed push without a runtime id");
                        }
                    }
                }
                None
            }
        }
    }

    // ─── Connectivity ───

    /// Switch connection state.
    ///
    /// Connecting replays the offline queue and returns the replies in replay
    /// order. Disconnecting does not cancel anything already in flight.
    pub async fn set_connected(&mut self, connected: bool) -> Vec<Envelope> {
        if !connected {
            if self.connected {
                self.connected = false;
                if let Err(e) = self.protocol.disconnect().await {
                    tracing::warn!(channel = %self.name, error = %e, "disconnect failed");
                }
                tracing::info!(channel = %self.name, "disconnected");
            }
            return Vec::new();
        }

        if !self.connected {
            if let Err(e) = self.protocol.connect().await {
                self.errors
                    .publish(ErrorEvent::new(self.name.clone(), None, None, e.to_string()));
                return Vec::new();
            }
            self.connected = true;
            tracing::info!(channel = %self.name, pending = self.queue.len(), "connected");
        }
        self.replay().await
    }

    async fn replay(&mut self) -> Vec<Envelope> {
        let pending = self.queue.take_all();
        let mut replies = Vec::with_capacity(pending.len());
        for (_, envelope) in pending {
            if let Some(reply) = self.push(envelope).await {
                replies.push(reply);
            }
        }
        replies
    }

    // ─── Fetch ───

    /// Fetch the remote collection. Failures are also published.
    pub async fn fetch(&self, since: Option<&str>) -> Result<FetchOutcome> {
        self.protocol.fetch(since).await.map_err(|e| {
            self.errors
                .publish(ErrorEvent::new(self.name.clone(), None, None, e.to_string()));
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpOptions, HttpProtocol};
    use crate::transport::memory::MemoryServer;
    use crate::transport::Method;
    use serde_json::json;
    use std::sync::Arc;
    use tether_core::ServerId;

    fn channel(server: &Arc<MemoryServer>) -> (RemoteChannel, ErrorBus) {
        let errors = ErrorBus::default();
        let protocol = HttpProtocol::new(server.clone(), HttpOptions::new("/todos"));
        let channel = RemoteChannel::new(
            "todos",
            Box::new(protocol),
            TransactionCounter::new(),
            errors.clone(),
        );
        (channel, errors)
    }

    fn todo(rt: u64, title: &str) -> Envelope {
        Envelope::save(json!({ "title": title })).with_rt_id(RtId(rt))
    }

    #[tokio::test]
    async fn test_offline_replay_latest_wins_in_first_queued_order() {
        let server = Arc::new(MemoryServer::new().with_collection("/todos"));
        let (mut channel, _) = channel(&server);

        assert!(channel.submit(todo(1, "a")).await.unwrap().is_none());
        assert!(channel.submit(todo(2, "b")).await.unwrap().is_none());
        assert!(channel.submit(todo(1, "c")).await.unwrap().is_none());
        assert_eq!(channel.queue().len(), 2);
        assert!(server.requests().await.is_empty());

        let replies = channel.set_connected(true).await;

        let requests = server.requests().await;
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].body, Some(json!({"title": "c"})));
        assert_eq!(requests[1].body, Some(json!({"title": "b"})));
        assert_eq!(replies[0].rt_id(), Some(RtId(1)));
        assert_eq!(replies[1].rt_id(), Some(RtId(2)));
        assert!(channel.queue().is_empty());
    }

    #[tokio::test]
    async fn test_connected_push_returns_reply() {
        let server = Arc::new(MemoryServer::new().with_collection_from("/todos", 55));
        let (mut channel, _) = channel(&server);
        channel.set_connected(true).await;

        let reply = channel.submit(todo(1, "milk")).await.unwrap().unwrap();
        assert_eq!(reply.server_id(), Some(&ServerId::from(55u64)));
        assert!(reply.meta.transaction_id.is_some());
    }

    #[tokio::test]
    async fn test_transport_failure_requeues_and_publishes() {
        let server = Arc::new(MemoryServer::new().with_collection("/todos"));
        let (mut channel, errors) = channel(&server);
        let mut events = errors.subscribe();
        channel.set_connected(true).await;

        server.set_reachable(false).await;
        let mut envelope = todo(3, "x");
        let transaction_id = channel.stamp(&mut envelope);
        let waiter = channel.wait_for(transaction_id);
        assert!(channel.submit(envelope).await.unwrap().is_none());

        let event = events.recv().await.unwrap();
        assert_eq!(event.target.transaction_id, Some(transaction_id));
        assert_eq!(event.target.rt_id, Some(RtId(3)));
        assert!(waiter.await.unwrap().is_err());
        assert!(channel.queue().get(RtId(3)).is_some());

        server.set_reachable(true).await;
        channel.set_connected(false).await;
        let replies = channel.set_connected(true).await;
        assert_eq!(replies.len(), 1);
        assert!(channel.queue().is_empty());
    }

    #[tokio::test]
    async fn test_server_error_requeues_and_replays() {
        let server = Arc::new(MemoryServer::new().with_collection_from("/todos", 55));
        let (mut channel, _) = channel(&server);
        channel.set_connected(true).await;
        server.fail_next(1).await;

        assert!(channel.submit(todo(1, "x")).await.unwrap().is_none());
        assert!(channel.queue().get(RtId(1)).is_some());

        channel.set_connected(false).await;
        let replies = channel.set_connected(true).await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].server_id(), Some(&ServerId::from(55u64)));
        assert_eq!(server.items("/todos").await, vec![json!({"title": "x", "id": 55})]);
        assert!(channel.queue().is_empty());
    }

    #[tokio::test]
    async fn test_client_error_is_not_requeued() {
        let server = Arc::new(MemoryServer::new().with_collection("/todos"));
        let (mut channel, _) = channel(&server);
        channel.set_connected(true).await;

        let update = todo(1, "x").with_server_id(9u64);
        assert!(channel.submit(update).await.unwrap().is_none());
        assert!(channel.queue().is_empty());
    }

    #[tokio::test]
    async fn test_direct_push_supersedes_failed_envelope() {
        let server = Arc::new(MemoryServer::new().with_collection_from("/todos", 55));
        let (mut channel, _) = channel(&server);
        channel.set_connected(true).await;

        server.set_reachable(false).await;
        channel.submit(todo(1, "v1")).await.unwrap();
        assert!(channel.queue().get(RtId(1)).is_some());

        server.set_reachable(true).await;
        let mut second = todo(1, "v2");
        let transaction_id = channel.stamp(&mut second);
        let waiter = channel.wait_for(transaction_id);
        channel.submit(second).await.unwrap();
        assert!(channel.queue().is_empty());
        assert!(waiter.await.unwrap().is_ok());

        channel.set_connected(false).await;
        assert!(channel.set_connected(true).await.is_empty());
        assert_eq!(server.items("/todos").await, vec![json!({"title": "v2", "id": 55})]);
    }

    #[tokio::test]
    async fn test_refreshed_pending_envelope_replays_as_update() {
        let server = Arc::new(MemoryServer::new().with_collection_from("/todos", 55));
        server.seed("/todos", json!({"title": "old"})).await;
        let (mut channel, _) = channel(&server);

        channel.submit(todo(1, "new")).await.unwrap();
        channel.refresh_pending(|envelope| {
            envelope.meta.server_id.get_or_insert(ServerId::from(55u64));
        });
        channel.set_connected(true).await;

        assert_eq!(server.count(Method::Post).await, 0);
        assert_eq!(server.count(Method::Put).await, 1);
        assert_eq!(server.items("/todos").await, vec![json!({"title": "new", "id": 55})]);
    }

    #[tokio::test]
    async fn test_forget_drops_pending_envelope() {
        let server = Arc::new(MemoryServer::new().with_collection("/todos"));
        let (mut channel, _) = channel(&server);

        channel.submit(todo(1, "x")).await.unwrap();
        assert!(channel.forget(RtId(1)).is_some());
        assert!(channel.forget(RtId(1)).is_none());
        assert!(channel.set_connected(true).await.is_empty());
        assert!(server.requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_follows_superseding_envelope() {
        let server = Arc::new(MemoryServer::new().with_collection("/todos"));
        let (mut channel, _) = channel(&server);

        let mut first = todo(1, "a");
        let transaction_id = channel.stamp(&mut first);
        let waiter = channel.wait_for(transaction_id);
        channel.submit(first).await.unwrap();
        channel.submit(todo(1, "b")).await.unwrap();

        channel.set_connected(true).await;
        let reply = waiter.await.unwrap().unwrap();
        assert_eq!(reply.data, json!({"title": "b"}));
        assert_ne!(reply.meta.transaction_id, Some(transaction_id));
    }

    #[tokio::test]
    async fn test_queue_requires_rt_id() {
        let server = Arc::new(MemoryServer::new().with_collection("/todos"));
        let (mut channel, _) = channel(&server);

        let result = channel.submit(Envelope::save(json!({}))).await;
        assert!(matches!(result, Err(SyncError::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn test_delete_reply_is_permanent() {
        let server = Arc::new(MemoryServer::new().with_collection("/todos"));
        server.seed("/todos", json!({"title": "x"})).await;
        let (mut channel, _) = channel(&server);
        channel.set_connected(true).await;

        let delete = todo(1, "x")
            .with_action(Action::Delete)
            .with_server_id(1u64)
            .with_deleted(true);
        let reply = channel.submit(delete).await.unwrap().unwrap();
        assert_eq!(reply.action(), Some(&Action::DeletePermanently));
        assert_eq!(server.count(Method::Delete).await, 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_published() {
        let server = Arc::new(MemoryServer::new().with_collection("/todos"));
        let (channel, errors) = channel(&server);
        let mut events = errors.subscribe();
        server.set_reachable(false).await;

        assert!(channel.fetch(None).await.is_err());
        assert_eq!(events.recv().await.unwrap().target.collection, "todos");
    }
}
