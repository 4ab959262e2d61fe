//! Entity handle: the canonical in-memory record of one logical entity.
//!
//! ```text
//! active --save--> active
//! active | soft-deleted --delete--> soft-deleted
//! any --deletePermanently (local store only)--> gone
//! ```
//!
//! `gone` has no representation here: the registry drops the handle from its
//! arena and every index, so nothing can reach it afterwards.

use serde_json::Value;
use tether_core::{Action, Envelope, Meta, RtId};

/// Lifecycle state of a live handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Active,
    SoftDeleted,
}

/// What applying an envelope did to a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Data and metadata replaced.
    Saved,
    /// Marked deleted, still indexed.
    SoftDeleted,
    /// Function reply recorded in the data.
    Called,
    /// The handle must be disposed.
    Gone,
}

/// One entity: resting metadata plus data.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityHandle {
    pub(crate) meta: Meta,
    data: Value,
}

impl EntityHandle {
    /// Create a handle from a reconciled envelope that already has an rtId.
    pub(crate) fn new(envelope: &Envelope) -> Self {
        Self {
            meta: envelope.meta.resting(),
            data: envelope.data.clone(),
        }
    }

    pub fn rt_id(&self) -> Option<RtId> {
        self.meta.rt_id
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn state(&self) -> HandleState {
        if self.meta.deleted {
            HandleState::SoftDeleted
        } else {
            HandleState::Active
        }
    }

    /// Apply a reconciled envelope.
    ///
    /// A `null` payload leaves the data alone, so id-only envelopes never
    /// erase an entity.
    pub fn apply(&mut self, envelope: &Envelope) -> Transition {
        let action = envelope.action().unwrap_or(&Action::Save);
        if matches!(action, Action::DeletePermanently) {
            return Transition::Gone;
        }

        self.meta = envelope.meta.resting();
        if !envelope.data.is_null() {
            self.data = envelope.data.clone();
        }

        match action {
            Action::Delete => {
                self.meta.deleted = true;
                Transition::SoftDeleted
            }
            Action::Function { .. } => Transition::Called,
            _ => Transition::Saved,
        }
    }

    /// The handle as an envelope carrying `action`.
    pub fn snapshot(&self, action: Action) -> Envelope {
        Envelope {
            meta: Meta {
                action: Some(action),
                ..self.meta.clone()
            },
            data: self.data.clone(),
        }
    }
}
