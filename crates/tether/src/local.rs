//! Local sync channel: translates envelopes into local-store calls.
//!
//! Writes are gated on the adapter's connectivity signal. While the adapter
//! is disconnected, envelopes are buffered in arrival order and released in
//! that order once it reconnects; nothing is reordered or deduplicated.
//!
//! | Action | Condition | Adapter call | Echo |
//! |--------|-----------|--------------|------|
//! | save | | `put` | save with the assigned storeId |
//! | delete | no serverId | `remove` | deletePermanently |
//! | delete | serverId | `put` (deleted flag) | delete |
//! | deletePermanently | | `remove` | deletePermanently |
//! | function | | none | none |

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;
use tether_core::{Action, Envelope, RecordKeys, StoreId};
use tether_store::{LocalAdapter, LocalAdapterExt, StoreError};
use tether_sync::{ErrorBus, ErrorEvent};
use tokio::sync::watch;

use crate::error::{EngineError, Result};

/// Persistence pipeline for one collection or relationship.
pub struct LocalChannel {
    name: String,
    adapter: Arc<dyn LocalAdapter>,
    keys: RecordKeys,
    connectivity: watch::Receiver<bool>,
    buffer: VecDeque<Envelope>,
    errors: ErrorBus,
}

impl LocalChannel {
    pub fn new(
        name: impl Into<String>,
        adapter: Arc<dyn LocalAdapter>,
        keys: RecordKeys,
        errors: ErrorBus,
    ) -> Self {
        let connectivity = adapter.connectivity();
        Self {
            name: name.into(),
            adapter,
            keys,
            connectivity,
            buffer: VecDeque::new(),
            errors,
        }
    }

    pub fn keys(&self) -> &RecordKeys {
        &self.keys
    }

    /// Whether writes are being held back.
    pub fn is_paused(&self) -> bool {
        !*self.connectivity.borrow()
    }

    /// Number of buffered envelopes.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Write an envelope, or buffer it while paused.
    ///
    /// Returns the echo to feed back into the registry. Storage failures are
    /// published on the error stream.
    pub async fn submit(&mut self, envelope: Envelope) -> Option<Envelope> {
        if self.is_paused() || !self.buffer.is_empty() {
            self.buffer.push_back(envelope);
            tracing::debug!(store = %self.name, pending = self.buffer.len(), "buffered local write");
            return None;
        }
        self.write(envelope).await
    }

    /// Next buffered envelope, if the adapter is connected again.
    pub fn next_buffered(&mut self) -> Option<Envelope> {
        if self.is_paused() {
            return None;
        }
        self.buffer.pop_front()
    }

    /// Write buffered envelopes as they are, oldest first, while the adapter
    /// stays connected. Echoes are dropped.
    ///
    /// For records whose keys never change after buffering, such as
    /// relationship triples.
    pub async fn flush(&mut self) {
        while let Some(envelope) = self.next_buffered() {
            let left = self.buffer.len();
            if self.write(envelope).await.is_none() && self.buffer.len() > left {
                return;
            }
        }
    }

    /// Write one envelope now.
    ///
    /// A connection lost mid-write puts the envelope back at the head of the
    /// buffer.
    pub async fn write(&mut self, envelope: Envelope) -> Option<Envelope> {
        match self.translate(&envelope).await {
            Ok(echo) => echo,
            Err(EngineError::Store(StoreError::NoConnection)) => {
                tracing::debug!(store = %self.name, "store went away, pausing");
                self.buffer.push_front(envelope);
                None
            }
            Err(e) => {
                self.errors.publish(ErrorEvent::new(
                    self.name.clone(),
                    envelope.meta.transaction_id,
                    envelope.rt_id(),
                    e.to_string(),
                ));
                None
            }
        }
    }

    async fn translate(&self, envelope: &Envelope) -> Result<Option<Envelope>> {
        match envelope.action().unwrap_or(&Action::Save) {
            Action::Save => self.put(envelope, Action::Save).await.map(Some),
            Action::Delete if envelope.server_id().is_some() => {
                self.put(envelope, Action::Delete).await.map(Some)
            }
            Action::Delete | Action::DeletePermanently => self.remove(envelope).await.map(Some),
            Action::Function { .. } => Ok(None),
        }
    }

    async fn put(&self, envelope: &Envelope, action: Action) -> Result<Envelope> {
        let record = self.keys.encode(envelope)?;
        let written = self.adapter.put_one(record).await?;

        let mut echo = envelope.clone();
        echo.meta.store_id = Some(written.key);
        echo.meta.action = Some(action);
        Ok(echo)
    }

    async fn remove(&self, envelope: &Envelope) -> Result<Envelope> {
        if envelope.store_id().is_some() {
            let record = self.keys.encode(envelope)?;
            self.adapter.remove(&record).await?;
        }
        let mut echo = envelope.clone();
        echo.meta.action = Some(Action::DeletePermanently);
        Ok(echo)
    }

    // ─── Reads ───

    /// Every stored record as an envelope without action or runtime id.
    pub async fn load_all(&self) -> Result<Vec<Envelope>> {
        let records = self.adapter.get_all_entries().await?;
        let mut envelopes = Vec::with_capacity(records.len());
        for record in records {
            envelopes.push(self.keys.decode(record)?);
        }
        Ok(envelopes)
    }

    /// One stored record.
    pub async fn get(&self, store_id: StoreId) -> Result<Option<Envelope>> {
        match self.adapter.get_entry(store_id).await? {
            Some(record) => Ok(Some(self.keys.decode(record)?)),
            None => Ok(None),
        }
    }

    pub async fn get_metadata(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.adapter.get_metadata(key).await?)
    }

    pub async fn set_metadata(&self, key: &str, value: Value) -> Result<()> {
        Ok(self.adapter.set_metadata(key, value).await?)
    }
}

/// Stand-in for collections that are not persisted.
///
/// Nothing is written; removals are confirmed at once so permanent deletion
/// still reaches the registry.
pub fn passthrough(envelope: Envelope) -> Option<Envelope> {
    let confirm = match envelope.action() {
        Some(Action::DeletePermanently) => true,
        Some(Action::Delete) => envelope.server_id().is_none(),
        _ => false,
    };
    confirm.then(|| envelope.with_action(Action::DeletePermanently))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_core::RtId;
    use tether_store::MemoryAdapter;

    fn channel() -> (LocalChannel, Arc<MemoryAdapter>, ErrorBus) {
        let adapter = Arc::new(MemoryAdapter::new("_id").with_first_key(101));
        let errors = ErrorBus::default();
        let channel = LocalChannel::new("todos", adapter.clone(), RecordKeys::default(), errors.clone());
        (channel, adapter, errors)
    }

    #[tokio::test]
    async fn test_save_echoes_store_id() {
        let (mut channel, adapter, _) = channel();
        let echo = channel
            .submit(Envelope::save(json!({"title": "milk"})).with_rt_id(RtId(1)))
            .await
            .unwrap();

        assert_eq!(echo.store_id(), Some(StoreId(101)));
        assert_eq!(echo.rt_id(), Some(RtId(1)));
        assert_eq!(adapter.peek(StoreId(101)), Some(json!({"title": "milk", "_id": 101})));
    }

    #[tokio::test]
    async fn test_delete_without_server_id_removes() {
        let (mut channel, adapter, _) = channel();
        let saved = channel.submit(Envelope::save(json!({}))).await.unwrap();

        let echo = channel
            .submit(saved.with_action(Action::Delete).with_deleted(true))
            .await
            .unwrap();
        assert_eq!(echo.action(), Some(&Action::DeletePermanently));
        assert!(adapter.is_empty());
    }

    #[tokio::test]
    async fn test_delete_with_server_id_keeps_soft_deleted_record() {
        let (mut channel, adapter, _) = channel();
        let saved = channel
            .submit(Envelope::save(json!({})).with_server_id(9u64))
            .await
            .unwrap();

        let echo = channel
            .submit(saved.with_action(Action::Delete).with_deleted(true))
            .await
            .unwrap();
        assert_eq!(echo.action(), Some(&Action::Delete));
        assert_eq!(
            adapter.peek(StoreId(101)),
            Some(json!({"_id": 101, "id": 9, "_deleted": true}))
        );
    }

    #[tokio::test]
    async fn test_paused_writes_are_buffered_in_order() {
        let (mut channel, adapter, _) = channel();
        adapter.set_connected(false);

        assert!(channel.submit(Envelope::save(json!({"n": 1}))).await.is_none());
        assert!(channel.submit(Envelope::save(json!({"n": 2}))).await.is_none());
        assert_eq!(channel.pending(), 2);
        assert!(channel.next_buffered().is_none());

        adapter.set_connected(true);
        let first = channel.next_buffered().unwrap();
        assert_eq!(first.data, json!({"n": 1}));
        channel.write(first).await.unwrap();
        let second = channel.next_buffered().unwrap();
        assert_eq!(second.data, json!({"n": 2}));
        assert!(channel.next_buffered().is_none());
    }

    #[tokio::test]
    async fn test_flush_writes_buffer_once_connected() {
        let (mut channel, adapter, _) = channel();
        adapter.set_connected(false);
        channel.submit(Envelope::save(json!({"n": 1}))).await;
        channel.submit(Envelope::save(json!({"n": 2}))).await;

        channel.flush().await;
        assert_eq!(channel.pending(), 2);

        adapter.set_connected(true);
        channel.flush().await;
        assert_eq!(channel.pending(), 0);
        assert_eq!(adapter.peek(StoreId(101)), Some(json!({"n": 1, "_id": 101})));
        assert_eq!(adapter.peek(StoreId(102)), Some(json!({"n": 2, "_id": 102})));
    }

    #[tokio::test]
    async fn test_transaction_failure_is_published() {
        let (mut channel, adapter, errors) = channel();
        let mut events = errors.subscribe();
        adapter.fail_next_write("disk full");

        let envelope = Envelope::save(json!({})).with_rt_id(RtId(3));
        assert!(channel.submit(envelope).await.is_none());

        let event = events.recv().await.unwrap();
        assert_eq!(event.target.rt_id, Some(RtId(3)));
        assert!(event.message.contains("disk full"));
        assert_eq!(channel.pending(), 0);
    }

    #[tokio::test]
    async fn test_load_all_and_metadata() {
        let (mut channel, _, _) = channel();
        channel
            .submit(Envelope::save(json!({"n": 1})).with_server_id(4u64))
            .await;

        let loaded = channel.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].store_id(), Some(StoreId(101)));
        assert_eq!(loaded[0].server_id(), Some(&4u64.into()));
        assert!(loaded[0].action().is_none());

        channel.set_metadata("lastFetch", json!("12")).await.unwrap();
        assert_eq!(channel.get_metadata("lastFetch").await.unwrap(), Some(json!("12")));
    }

    #[test]
    fn test_passthrough_confirms_removals_only() {
        let save = Envelope::save(json!({}));
        assert!(passthrough(save).is_none());

        let local_delete = Envelope::new(json!({})).with_action(Action::Delete);
        assert_eq!(
            passthrough(local_delete).unwrap().action(),
            Some(&Action::DeletePermanently)
        );

        let remote_delete = Envelope::new(json!({}))
            .with_action(Action::Delete)
            .with_server_id(1u64);
        assert!(passthrough(remote_delete).is_none());
    }
}
