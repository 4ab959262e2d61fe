//! Entity registry: the reconciliation core.
//!
//! The registry owns every [`EntityHandle`] of one entity type in an arena
//! keyed by runtime id, plus two secondary indices (server id, store id). It
//! performs no I/O: [`Registry::process`] takes one envelope from one source
//! and answers where the reconciled envelope must go next.
//!
//! ## Reconciliation
//!
//! 1. Look up a known handle by rtId, then serverId, then storeId.
//! 2. Known: fill the handle's missing ids from the envelope (never overwrite),
//!    OR the deleted flag, then replace the envelope's metadata with the
//!    handle's, keeping the request fields.
//! 3. Newly learned ids are indexed against the known handle.
//! 4. Unknown and without an rtId: a new handle is created and announced as a
//!    `save`.
//!
//! ## Routing
//!
//! | Source | Action | Known handle | Goes to |
//! |--------|--------|--------------|---------|
//! | external | save | new or known | local, remote, downstream |
//! | external | delete | known | local, downstream, remote if it has a serverId |
//! | external | function | known | remote |
//! | remote | save / delete | new or known | local, downstream |
//! | remote | deletePermanently | known | local |
//! | remote | function | known | downstream |
//! | local | save / delete | known | downstream |
//! | local | deletePermanently | known | disposes, downstream |
//! | local | save / delete | new (initial load) | downstream, remote if unfinished |

use std::collections::{BTreeMap, HashMap};

use tether_core::{adopt_known, fill_missing, Action, Envelope, RtId, ServerId, StoreId};

use crate::handle::{EntityHandle, Transition};

/// Where an envelope came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Submitted by a caller.
    External,
    /// Remote sync channel output: replies and fetched items.
    Remote,
    /// Local sync channel output: write echoes and loaded records.
    Local,
}

/// A reconciled envelope and its destinations.
#[derive(Debug, Clone, PartialEq)]
pub struct Routed {
    pub envelope: Envelope,
    pub local: bool,
    pub remote: bool,
    pub downstream: bool,
}

impl Routed {
    fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            local: false,
            remote: false,
            downstream: false,
        }
    }

    fn to_local(mut self) -> Self {
        self.local = true;
        self
    }

    fn to_remote(mut self) -> Self {
        self.remote = true;
        self
    }

    fn to_remote_if(mut self, condition: bool) -> Self {
        self.remote = condition;
        self
    }

    fn downstream(mut self) -> Self {
        self.downstream = true;
        self
    }
}

/// Identity registry for one entity type.
#[derive(Debug, Default)]
pub struct Registry {
    name: String,
    last_rt_id: u64,
    handles: BTreeMap<RtId, EntityHandle>,
    by_server: HashMap<ServerId, RtId>,
    by_store: HashMap<StoreId, RtId>,
}

impl Registry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ─── Lookups ───

    pub fn get(&self, rt_id: RtId) -> Option<&EntityHandle> {
        self.handles.get(&rt_id)
    }

    pub fn get_by_server_id(&self, server_id: &ServerId) -> Option<&EntityHandle> {
        self.by_server.get(server_id).and_then(|rt_id| self.handles.get(rt_id))
    }

    pub fn get_by_store_id(&self, store_id: StoreId) -> Option<&EntityHandle> {
        self.by_store.get(&store_id).and_then(|rt_id| self.handles.get(rt_id))
    }

    /// Every live handle, ordered by runtime id.
    pub fn all(&self) -> impl Iterator<Item = &EntityHandle> {
        self.handles.values()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Fill an envelope's missing ids from the handle it belongs to.
    ///
    /// Used for envelopes that waited in a buffer while the handle learned
    /// more about itself.
    pub fn refresh(&self, envelope: &mut Envelope) {
        if let Some(handle) = envelope.rt_id().and_then(|rt_id| self.handles.get(&rt_id)) {
            let deleted = envelope.meta.deleted;
            fill_missing(&mut envelope.meta, &handle.meta);
            envelope.meta.deleted = deleted;
        }
    }

    // ─── Processing ───

    /// Reconcile one envelope and decide where it goes.
    ///
    /// `None` means the envelope was dropped.
    pub fn process(&mut self, source: Source, mut envelope: Envelope) -> Option<Routed> {
        let action = envelope.action().cloned().unwrap_or(Action::Save);
        if matches!(action, Action::Delete) {
            envelope.meta.deleted = true;
        }
        envelope.meta.action = Some(action.clone());

        match self.reconcile(&mut envelope) {
            Some(rt_id) => self.known(source, rt_id, &action, envelope),
            None => self.unknown(source, &action, envelope),
        }
    }

    fn lookup(&self, envelope: &Envelope) -> Option<RtId> {
        envelope
            .rt_id()
            .filter(|rt_id| self.handles.contains_key(rt_id))
            .or_else(|| envelope.server_id().and_then(|id| self.by_server.get(id).copied()))
            .or_else(|| envelope.store_id().and_then(|id| self.by_store.get(&id).copied()))
    }

    /// Merge the envelope into its known handle's identity.
    fn reconcile(&mut self, envelope: &mut Envelope) -> Option<RtId> {
        let rt_id = self.lookup(envelope)?;

        // An id already indexed to another entity is never adopted.
        let mut incoming = envelope.meta.clone();
        if incoming
            .server_id
            .as_ref()
            .and_then(|id| self.by_server.get(id))
            .is_some_and(|owner| *owner != rt_id)
        {
            tracing::warn!(collection = %self.name, %rt_id, "ignoring server id owned by another entity");
            incoming.server_id = None;
        }
        if incoming
            .store_id
            .and_then(|id| self.by_store.get(&id))
            .is_some_and(|owner| *owner != rt_id)
        {
            tracing::warn!(collection = %self.name, %rt_id, "ignoring store id owned by another entity");
            incoming.store_id = None;
        }

        let handle = self.handles.get_mut(&rt_id)?;
        let learned = fill_missing(&mut handle.meta, &incoming);
        adopt_known(envelope, &handle.meta);

        if let Some(server_id) = learned.server_id {
            tracing::debug!(collection = %self.name, %rt_id, %server_id, "learned server id");
            self.index_server(server_id, rt_id);
        }
        if let Some(store_id) = learned.store_id {
            tracing::debug!(collection = %self.name, %rt_id, %store_id, "learned store id");
            self.index_store(store_id, rt_id);
        }
        Some(rt_id)
    }

    fn known(
        &mut self,
        source: Source,
        rt_id: RtId,
        action: &Action,
        mut envelope: Envelope,
    ) -> Option<Routed> {
        match (source, action) {
            (_, Action::DeletePermanently) if source != Source::Local => {
                if source == Source::External {
                    tracing::warn!(collection = %self.name, %rt_id, "deletePermanently can only come from the local store");
                    return None;
                }
                // The local store removes the record; its echo disposes the handle.
                return Some(Routed::new(self.with_data(rt_id, envelope)).to_local());
            }
            (Source::Local, Action::DeletePermanently) => {
                self.dispose(rt_id);
                return Some(Routed::new(envelope).downstream());
            }
            (Source::Local, Action::Function { .. }) => return None,
            (Source::External, Action::Function { .. }) => {
                return Some(Routed::new(self.with_data(rt_id, envelope)).to_remote());
            }
            _ => {}
        }

        let handle = self.handles.get_mut(&rt_id)?;
        let transition = handle.apply(&envelope);
        envelope.data = handle.data().clone();

        let routed = Routed::new(envelope);
        let routed = match (source, transition) {
            (Source::External, Transition::SoftDeleted) => {
                let has_server = routed.envelope.server_id().is_some();
                routed.to_local().downstream().to_remote_if(has_server)
            }
            (Source::External, _) => routed.to_local().to_remote().downstream(),
            (Source::Remote, Transition::Called) => routed.downstream(),
            (Source::Remote, _) => routed.to_local().downstream(),
            (Source::Local, _) => routed.downstream(),
        };
        Some(routed)
    }

    fn unknown(&mut self, source: Source, action: &Action, mut envelope: Envelope) -> Option<Routed> {
        if let Some(rt_id) = envelope.rt_id() {
            tracing::debug!(collection = %self.name, %rt_id, source = ?source, "dropping envelope for unknown entity");
            return None;
        }
        match (source, action) {
            (_, Action::DeletePermanently) | (_, Action::Function { .. }) => {
                tracing::debug!(collection = %self.name, action = action.label(), "ignoring action for unknown entity");
                return None;
            }
            (Source::External, Action::Delete) => {
                tracing::warn!(collection = %self.name, "cannot delete an entity that was never saved");
                return None;
            }
            _ => {}
        }

        let rt_id = self.next_rt_id();
        envelope.meta.rt_id = Some(rt_id);
        let action = if envelope.meta.deleted {
            Action::Delete
        } else {
            Action::Save
        };
        envelope.meta.action = Some(action.clone());

        self.insert(EntityHandle::new(&envelope), rt_id);
        tracing::debug!(collection = %self.name, %rt_id, source = ?source, "new entity");

        let routed = Routed::new(envelope);
        Some(match source {
            Source::External => routed.to_local().to_remote().downstream(),
            Source::Remote => routed.to_local().downstream(),
            Source::Local => {
                let has_server = routed.envelope.server_id().is_some();
                let unfinished = match action {
                    Action::Delete => has_server,
                    _ => !has_server,
                };
                routed.downstream().to_remote_if(unfinished)
            }
        })
    }

    // ─── Arena ───

    fn next_rt_id(&mut self) -> RtId {
        self.last_rt_id += 1;
        RtId(self.last_rt_id)
    }

    fn insert(&mut self, handle: EntityHandle, rt_id: RtId) {
        if let Some(server_id) = handle.meta.server_id.clone() {
            self.index_server(server_id, rt_id);
        }
        if let Some(store_id) = handle.meta.store_id {
            self.index_store(store_id, rt_id);
        }
        self.handles.insert(rt_id, handle);
    }

    fn index_server(&mut self, server_id: ServerId, rt_id: RtId) {
        self.by_server.insert(server_id, rt_id);
    }

    fn index_store(&mut self, store_id: StoreId, rt_id: RtId) {
        self.by_store.insert(store_id, rt_id);
    }

    /// Remove a handle from the arena and every index.
    fn dispose(&mut self, rt_id: RtId) {
        let Some(handle) = self.handles.remove(&rt_id) else {
            return;
        };
        if let Some(server_id) = &handle.meta.server_id {
            if self.by_server.get(server_id) == Some(&rt_id) {
                self.by_server.remove(server_id);
            }
        }
        if let Some(store_id) = handle.meta.store_id {
            if self.by_store.get(&store_id) == Some(&rt_id) {
                self.by_store.remove(&store_id);
            }
        }
        tracing::debug!(collection = %self.name, %rt_id, "entity disposed");
    }

    /// Envelope with the handle's data when it carries none.
    fn with_data(&self, rt_id: RtId, mut envelope: Envelope) -> Envelope {
        if envelope.data.is_null() {
            if let Some(handle) = self.handles.get(&rt_id) {
                envelope.data = handle.data().clone();
            }
        }
        envelope
    }

    #[cfg(test)]
    fn indices_consistent(&self) -> bool {
        self.handles.iter().all(|(rt_id, handle)| {
            handle.rt_id() == Some(*rt_id)
                && handle
                    .meta
                    .server_id
                    .as_ref()
                    .map_or(true, |id| self.by_server.get(id) == Some(rt_id))
                && handle
                    .meta
                    .store_id
                    .map_or(true, |id| self.by_store.get(&id) == Some(rt_id))
        }) && self.by_server.values().all(|rt_id| self.handles.contains_key(rt_id))
            && self.by_store.values().all(|rt_id| self.handles.contains_key(rt_id))
    }
}
