//! Envelope: the `{ meta, data }` unit exchanged between every pair of
//! components.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{RtId, ServerId, StoreId, TransactionId};

/// What an envelope requests or reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Action {
    /// Create or update.
    Save,
    /// Soft delete: sets the `deleted` flag, keeps the entity indexed.
    Delete,
    /// Permanent removal, only honoured when it comes from the local store.
    DeletePermanently,
    /// Named remote procedure call.
    Function {
        name: String,
        #[serde(default)]
        args: Value,
    },
}

impl Action {
    /// Build a function-call action.
    pub fn function(name: impl Into<String>, args: Value) -> Self {
        Action::Function {
            name: name.into(),
            args,
        }
    }

    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            Action::Save => "save",
            Action::Delete => "delete",
            Action::DeletePermanently => "deletePermanently",
            Action::Function { .. } => "function",
        }
    }
}

/// Envelope metadata.
///
/// The identity triple (`rt_id`, `store_id`, `server_id`) and `deleted` form an
/// entity's resting metadata. `action`, `transaction_id` and `server_data`
/// describe one request and are stripped by [`Meta::resting`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rt_id: Option<RtId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_id: Option<StoreId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<ServerId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<TransactionId>,

    /// Merged into the outbound representation, never mirrored into `data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_data: Option<Value>,
}

impl Meta {
    /// Copy of this metadata without the per-request fields.
    pub fn resting(&self) -> Meta {
        Meta {
            rt_id: self.rt_id,
            store_id: self.store_id,
            server_id: self.server_id.clone(),
            action: None,
            deleted: self.deleted,
            transaction_id: None,
            server_data: None,
        }
    }

    /// Whether any of the three identities is set.
    pub fn has_identity(&self) -> bool {
        self.rt_id.is_some() || self.store_id.is_some() || self.server_id.is_some()
    }
}

/// The unit of exchange between channels, the registry and handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub meta: Meta,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Envelope with the given payload and empty metadata.
    pub fn new(data: Value) -> Self {
        Self {
            meta: Meta::default(),
            data,
        }
    }

    /// Envelope requesting a save of `data`.
    pub fn save(data: Value) -> Self {
        Self::new(data).with_action(Action::Save)
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.meta.action = Some(action);
        self
    }

    pub fn with_rt_id(mut self, rt_id: RtId) -> Self {
        self.meta.rt_id = Some(rt_id);
        self
    }

    pub fn with_store_id(mut self, store_id: StoreId) -> Self {
        self.meta.store_id = Some(store_id);
        self
    }

    pub fn with_server_id(mut self, server_id: impl Into<ServerId>) -> Self {
        self.meta.server_id = Some(server_id.into());
        self
    }

    pub fn with_transaction_id(mut self, transaction_id: TransactionId) -> Self {
        self.meta.transaction_id = Some(transaction_id);
        self
    }

    pub fn with_server_data(mut self, server_data: Value) -> Self {
        self.meta.server_data = Some(server_data);
        self
    }

    pub fn with_deleted(mut self, deleted: bool) -> Self {
        self.meta.deleted = deleted;
        self
    }

    /// The requested action, if any.
    pub fn action(&self) -> Option<&Action> {
        self.meta.action.as_ref()
    }

    pub fn rt_id(&self) -> Option<RtId> {
        self.meta.rt_id
    }

    pub fn store_id(&self) -> Option<StoreId> {
        self.meta.store_id
    }

    pub fn server_id(&self) -> Option<&ServerId> {
        self.meta.server_id.as_ref()
    }
}
