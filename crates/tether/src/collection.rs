//! One entity type: registry, local channel and remote channel wired together.
//!
//! Every envelope, whatever its source, enters [`Collection::pump`]. The pump
//! reconciles it, emits it downstream, and feeds it to the local and remote
//! channels; their echoes and replies go back into the same queue. The local
//! echo of an envelope is queued ahead of its remote reply, so the store key
//! is known before the reply is written.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;
use tether_core::{Action, Envelope, RtId, ServerId, StoreId, TransactionCounter, TransactionId};
use tether_store::LocalAdapter;
use tether_sync::{
    ErrorBus, ErrorEvent, HttpProtocol, Outcome, ProtocolKind, RemoteChannel, RemoteProtocol,
    Transport, WebSocketProtocol,
};
use tokio::sync::{broadcast, oneshot};

use crate::config::CollectionConfig;
use crate::error::Result;
use crate::handle::EntityHandle;
use crate::local::{passthrough, LocalChannel};
use crate::registry::{Registry, Source};

/// Buffered downstream envelopes per subscriber.
const DOWNSTREAM_CAPACITY: usize = 1024;

/// Outcome of one external submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    /// Entity the submission belongs to, if it was accepted.
    pub rt_id: Option<RtId>,
    pub transaction_id: TransactionId,
    /// Everything emitted downstream while processing it.
    pub emitted: Vec<Envelope>,
    /// Whether it was handed to the remote channel (pushed or queued).
    pub sent_remote: bool,
}

/// What one pump run produced.
#[derive(Debug, Default)]
struct Pumped {
    emitted: Vec<Envelope>,
    sent_remote: bool,
}

/// Registry plus channels for one entity type.
pub struct Collection {
    config: CollectionConfig,
    registry: Registry,
    local: Option<LocalChannel>,
    remote: RemoteChannel,
    downstream: broadcast::Sender<Envelope>,
    watermark: Option<String>,
}

impl Collection {
    /// Build a collection. `adapter` is ignored when the collection is not
    /// persisted locally.
    pub fn new(
        config: CollectionConfig,
        adapter: Option<Arc<dyn LocalAdapter>>,
        transport: Arc<dyn Transport>,
        transactions: TransactionCounter,
        errors: ErrorBus,
    ) -> Self {
        let protocol: Box<dyn RemoteProtocol> = match config.protocol {
            ProtocolKind::Http => Box::new(HttpProtocol::new(transport, config.http_options())),
            ProtocolKind::Websocket => Box::new(WebSocketProtocol::new(config.route.clone())),
        };
        let local = match (config.persist_locally, adapter) {
            (true, Some(adapter)) => Some(LocalChannel::new(
                config.name.clone(),
                adapter,
                config.keys(),
                errors.clone(),
            )),
            (true, None) => {
                tracing::warn!(collection = %config.name, "no local store given, entities stay in memory");
                None
            }
            (false, _) => None,
        };
        let (downstream, _) = broadcast::channel(DOWNSTREAM_CAPACITY);

        Self {
            registry: Registry::new(config.name.clone()),
            remote: RemoteChannel::new(config.name.clone(), protocol, transactions, errors),
            local,
            downstream,
            watermark: None,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn remote(&self) -> &RemoteChannel {
        &self.remote
    }

    pub fn local(&self) -> Option<&LocalChannel> {
        self.local.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.remote.is_connected()
    }

    // ─── Lookups ───

    pub fn get(&self, rt_id: RtId) -> Option<&EntityHandle> {
        self.registry.get(rt_id)
    }

    pub fn get_by_server_id(&self, server_id: &ServerId) -> Option<&EntityHandle> {
        self.registry.get_by_server_id(server_id)
    }

    pub fn get_by_store_id(&self, store_id: StoreId) -> Option<&EntityHandle> {
        self.registry.get_by_store_id(store_id)
    }

    /// Every live entity, ordered by runtime id.
    pub fn all(&self) -> impl Iterator<Item = &EntityHandle> {
        self.registry.all()
    }

    /// Receive every envelope emitted downstream from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.downstream.subscribe()
    }

    // ─── Submission ───

    /// Submit an external change.
    pub async fn submit(&mut self, mut envelope: Envelope) -> Result<Submission> {
        let transaction_id = self.remote.stamp(&mut envelope);
        let requested = envelope.rt_id();
        let pumped = self.pump(Source::External, envelope).await?;

        Ok(Submission {
            rt_id: requested.or_else(|| pumped.emitted.iter().find_map(Envelope::rt_id)),
            transaction_id,
            emitted: pumped.emitted,
            sent_remote: pumped.sent_remote,
        })
    }

    /// Submit an external change and be told how the remote peer took it.
    ///
    /// A submission that never goes remote resolves at once with its last
    /// downstream envelope, or fails if it was dropped.
    pub async fn submit_and_track(
        &mut self,
        mut envelope: Envelope,
    ) -> Result<(Submission, oneshot::Receiver<Outcome>)> {
        let transaction_id = self.remote.stamp(&mut envelope);
        let waiter = self.remote.wait_for(transaction_id);
        let submission = self.submit(envelope).await?;

        if !submission.sent_remote {
            let outcome = match submission.emitted.last() {
                Some(envelope) => Ok(envelope.clone()),
                None => Err(ErrorEvent::new(
                    self.config.name.clone(),
                    Some(transaction_id),
                    submission.rt_id,
                    "submission was dropped",
                )),
            };
            self.remote.settle(transaction_id, outcome);
        }
        Ok((submission, waiter))
    }

    /// Register interest in a transaction already submitted.
    pub fn wait_for(&mut self, transaction_id: TransactionId) -> oneshot::Receiver<Outcome> {
        self.remote.wait_for(transaction_id)
    }

    // ─── Connectivity ───

    /// Connect or disconnect the remote channel.
    ///
    /// Connecting replays the offline queue and, with `fetch_on_connect`,
    /// fetches afterwards. Returns everything emitted downstream.
    pub async fn set_connected(&mut self, connected: bool) -> Result<Vec<Envelope>> {
        let mut released = Pumped::default();
        self.release_buffered(&mut released).await?;
        let mut emitted = released.emitted;

        // Ids learned while envelopes waited turn replayed creates into updates.
        if connected {
            let registry = &self.registry;
            self.remote.refresh_pending(|envelope| registry.refresh(envelope));
        }

        let replies = self.remote.set_connected(connected).await;
        for reply in replies {
            emitted.extend(self.pump(Source::Remote, reply).await?.emitted);
        }

        if connected && self.remote.is_connected() && self.config.fetch_on_connect {
            match self.fetch().await {
                Ok(fetched) => emitted.extend(fetched),
                Err(e) => tracing::warn!(collection = %self.config.name, error = %e, "fetch on connect failed"),
            }
        }
        Ok(emitted)
    }

    /// Fetch the remote collection and reconcile every item.
    ///
    /// Does nothing while disconnected.
    pub async fn fetch(&mut self) -> Result<Vec<Envelope>> {
        if !self.remote.is_connected() {
            tracing::debug!(collection = %self.config.name, "skipping fetch while disconnected");
            return Ok(Vec::new());
        }

        let since = self.watermark().await;
        let outcome = self.remote.fetch(since.as_deref()).await?;
        if let Some(watermark) = outcome.watermark {
            self.store_watermark(watermark).await;
        }
        if outcome.not_modified {
            tracing::debug!(collection = %self.config.name, "remote collection unchanged");
            return Ok(Vec::new());
        }

        let mut emitted = Vec::new();
        for envelope in outcome.envelopes {
            emitted.extend(self.pump(Source::Remote, envelope).await?.emitted);
        }
        tracing::info!(collection = %self.config.name, items = emitted.len(), "fetched");
        Ok(emitted)
    }

    async fn watermark(&self) -> Option<String> {
        if let Some(local) = &self.local {
            match local.get_metadata(&self.config.watermark_key).await {
                Ok(Some(Value::String(watermark))) => return Some(watermark),
                Ok(_) => {}
                Err(e) => tracing::warn!(collection = %self.config.name, error = %e, "cannot read watermark"),
            }
        }
        self.watermark.clone()
    }

    async fn store_watermark(&mut self, watermark: String) {
        if let Some(local) = &self.local {
            if let Err(e) = local
                .set_metadata(&self.config.watermark_key, Value::String(watermark.clone()))
                .await
            {
                tracing::warn!(collection = %self.config.name, error = %e, "cannot persist watermark");
            }
        }
        self.watermark = Some(watermark);
    }

    // ─── Local Store ───

    /// Load every stored record into the registry.
    ///
    /// Records that never reached the remote peer are pushed again, and so
    /// are soft deletions the peer has not confirmed.
    pub async fn load(&mut self) -> Result<Vec<Envelope>> {
        let Some(local) = &self.local else {
            return Ok(Vec::new());
        };
        let records = local.load_all().await?;

        let mut emitted = Vec::with_capacity(records.len());
        for envelope in records {
            emitted.extend(self.pump(Source::Local, envelope).await?.emitted);
        }
        tracing::info!(collection = %self.config.name, entities = self.registry.len(), "loaded");
        Ok(emitted)
    }

    /// Flush writes buffered while the local store was unavailable.
    ///
    /// Every operation of the collection does this first on its own; this
    /// only matters when nothing else happens after the store comes back.
    pub async fn resume_storage(&mut self) -> Result<Vec<Envelope>> {
        let mut pumped = Pumped::default();
        self.release_buffered(&mut pumped).await?;
        Ok(pumped.emitted)
    }

    /// Write buffered envelopes in arrival order while the store is connected.
    ///
    /// Each echo is reconciled before the next envelope is refreshed, so a
    /// store id assigned to an earlier write reaches later ones.
    async fn release_buffered(&mut self, pumped: &mut Pumped) -> Result<()> {
        loop {
            let Some(local) = self.local.as_mut() else {
                return Ok(());
            };
            let Some(mut envelope) = local.next_buffered() else {
                return Ok(());
            };
            self.registry.refresh(&mut envelope);
            let left = local.pending();
            let echo = local.write(envelope).await;
            if echo.is_none() && local.pending() > left {
                // Lost the store again; the envelope is back at the head.
                return Ok(());
            }
            if let Some(echo) = echo {
                self.drain(pumped, Source::Local, echo, false).await?;
            }
        }
    }

    // ─── Pump ───

    async fn pump(&mut self, source: Source, envelope: Envelope) -> Result<Pumped> {
        let mut pumped = Pumped::default();
        self.release_buffered(&mut pumped).await?;
        self.drain(&mut pumped, source, envelope, true).await?;
        Ok(pumped)
    }

    /// Run one envelope and everything it causes through the registry.
    ///
    /// `submitted` marks the envelope whose remote hand-off is reported in
    /// [`Pumped::sent_remote`].
    async fn drain(
        &mut self,
        pumped: &mut Pumped,
        source: Source,
        envelope: Envelope,
        submitted: bool,
    ) -> Result<()> {
        let mut queue = VecDeque::from([(source, envelope)]);
        let mut first = submitted;

        while let Some((source, envelope)) = queue.pop_front() {
            let routed = self.registry.process(source, envelope);
            let initial = std::mem::replace(&mut first, false);
            let Some(routed) = routed else {
                continue;
            };

            if matches!(routed.envelope.action(), Some(Action::DeletePermanently)) {
                if let Some(rt_id) = routed.envelope.rt_id().filter(|rt_id| self.registry.get(*rt_id).is_none()) {
                    self.remote.forget(rt_id);
                }
            }
            if routed.downstream {
                let _ = self.downstream.send(routed.envelope.clone());
                pumped.emitted.push(routed.envelope.clone());
            }
            if routed.local {
                let echo = match self.local.as_mut() {
                    Some(local) => local.submit(routed.envelope.clone()).await,
                    None => passthrough(routed.envelope.clone()),
                };
                if let Some(echo) = echo {
                    queue.push_back((Source::Local, echo));
                }
            }
            if routed.remote {
                pumped.sent_remote |= initial;
                if let Some(reply) = self.remote.submit(routed.envelope).await? {
                    queue.push_back((Source::Remote, reply));
                }
            }
        }
        Ok(())
    }
}
