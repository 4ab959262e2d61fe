//! Relationship membership: three disjoint id lists per parent entity.
//!
//! A member known to the remote peer lives in `server_items`; a member only
//! the local store knows lives in `store_items`. `deleted_items` holds server
//! ids whose removal has been announced but not yet confirmed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::Envelope;
use crate::error::{CoreError, Result};
use crate::types::{ServerId, StoreId};

/// One member reference, from whichever list it lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MemberRef {
    Server(ServerId),
    Store(StoreId),
}

/// Persisted membership of one relationship set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationRecord {
    #[serde(default)]
    pub server_items: Vec<ServerId>,
    #[serde(default)]
    pub store_items: Vec<StoreId>,
    #[serde(default)]
    pub deleted_items: Vec<ServerId>,
}

impl RelationRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains_server(&self, server_id: &ServerId) -> bool {
        self.server_items.contains(server_id)
    }

    pub fn contains_store(&self, store_id: StoreId) -> bool {
        self.store_items.contains(&store_id)
    }

    pub fn is_pending_removal(&self, server_id: &ServerId) -> bool {
        self.deleted_items.contains(server_id)
    }

    /// Add a member the remote peer knows. Returns whether anything changed.
    pub fn insert_server(&mut self, server_id: ServerId) -> bool {
        if self.server_items.contains(&server_id) {
            return false;
        }
        self.deleted_items.retain(|id| id != &server_id);
        self.server_items.push(server_id);
        true
    }

    /// Stage a member only the local store knows.
    pub fn stage_store(&mut self, store_id: StoreId) -> bool {
        if self.store_items.contains(&store_id) {
            return false;
        }
        self.store_items.push(store_id);
        true
    }

    /// Move a staged member onto the server list once its server id is known.
    ///
    /// Returns true only when the store id was staged, so a promotion happens
    /// at most once per member.
    pub fn promote(&mut self, store_id: StoreId, server_id: ServerId) -> bool {
        let before = self.store_items.len();
        self.store_items.retain(|id| *id != store_id);
        if self.store_items.len() == before {
            return false;
        }
        if !self.server_items.contains(&server_id) {
            self.server_items.push(server_id);
        }
        true
    }

    /// Move a server member to the pending-removal list.
    pub fn mark_removed(&mut self, server_id: &ServerId) -> bool {
        let before = self.server_items.len();
        self.server_items.retain(|id| id != server_id);
        if self.server_items.len() == before {
            return false;
        }
        if !self.deleted_items.contains(server_id) {
            self.deleted_items.push(server_id.clone());
        }
        true
    }

    /// Forget a pending removal once the remote peer confirmed it.
    pub fn confirm_removed(&mut self, server_id: &ServerId) -> bool {
        let before = self.deleted_items.len();
        self.deleted_items.retain(|id| id != server_id);
        self.deleted_items.len() != before
    }

    /// Drop a staged member that never reached the remote peer.
    pub fn drop_store(&mut self, store_id: StoreId) -> bool {
        let before = self.store_items.len();
        self.store_items.retain(|id| *id != store_id);
        self.store_items.len() != before
    }

    /// Forget a server member whose entity no longer exists, whether it was
    /// current or pending removal.
    pub fn drop_server(&mut self, server_id: &ServerId) -> bool {
        let before = self.server_items.len() + self.deleted_items.len();
        self.server_items.retain(|id| id != server_id);
        self.deleted_items.retain(|id| id != server_id);
        self.server_items.len() + self.deleted_items.len() != before
    }

    /// Union a fetched remote membership list into `server_items`.
    ///
    /// Ids pending removal stay out.
    pub fn merge_remote(&mut self, fetched: &[ServerId]) -> bool {
        let mut changed = false;
        for server_id in fetched {
            if self.deleted_items.contains(server_id) || self.server_items.contains(server_id) {
                continue;
            }
            self.server_items.push(server_id.clone());
            changed = true;
        }
        changed
    }

    /// Every current member exactly once, server members first.
    pub fn members(&self) -> Vec<MemberRef> {
        self.server_items
            .iter()
            .cloned()
            .map(MemberRef::Server)
            .chain(self.store_items.iter().copied().map(MemberRef::Store))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.server_items.len() + self.store_items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wrap the triple in a save envelope keyed by the parent's store id.
    pub fn to_envelope(&self, parent: StoreId) -> Result<Envelope> {
        let data = serde_json::to_value(self).map_err(|e| CoreError::Encoding(e.to_string()))?;
        Ok(Envelope::save(data).with_store_id(parent))
    }

    /// Read a triple back out of a decoded envelope's data.
    pub fn from_data(data: Value) -> Result<Self> {
        serde_json::from_value(data).map_err(|e| CoreError::InvalidRecord(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_promote_happens_once() {
        let mut record = RelationRecord::new();
        assert!(record.stage_store(StoreId(60)));

        assert!(record.promote(StoreId(60), ServerId::from(500)));
        assert!(!record.promote(StoreId(60), ServerId::from(500)));

        assert_eq!(record.server_items, vec![ServerId::from(500)]);
        assert!(record.store_items.is_empty());
    }

    #[test]
    fn test_remove_then_confirm() {
        let mut record = RelationRecord::new();
        record.insert_server(ServerId::from(7));

        assert!(record.mark_removed(&ServerId::from(7)));
        assert!(record.is_pending_removal(&ServerId::from(7)));
        assert!(!record.contains_server(&ServerId::from(7)));

        assert!(record.confirm_removed(&ServerId::from(7)));
        assert!(record.deleted_items.is_empty());
    }

    #[test]
    fn test_drop_server_clears_both_lists() {
        let mut record = RelationRecord::new();
        record.insert_server(ServerId::from(1));
        record.insert_server(ServerId::from(2));
        record.mark_removed(&ServerId::from(2));

        assert!(record.drop_server(&ServerId::from(1)));
        assert!(record.drop_server(&ServerId::from(2)));
        assert!(!record.drop_server(&ServerId::from(2)));
        assert!(record.server_items.is_empty());
        assert!(record.deleted_items.is_empty());
    }

    #[test]
    fn test_merge_remote_skips_pending_removals() {
        let mut record = RelationRecord::new();
        record.insert_server(ServerId::from(1));
        record.mark_removed(&ServerId::from(1));

        let changed = record.merge_remote(&[ServerId::from(1), ServerId::from(2)]);

        assert!(changed);
        assert_eq!(record.server_items, vec![ServerId::from(2)]);
    }

    #[test]
    fn test_members_lists_each_once() {
        let mut record = RelationRecord::new();
        record.insert_server(ServerId::from(1));
        record.insert_server(ServerId::from(2));
        record.stage_store(StoreId(10));

        assert_eq!(
            record.members(),
            vec![
                MemberRef::Server(ServerId::from(1)),
                MemberRef::Server(ServerId::from(2)),
                MemberRef::Store(StoreId(10)),
            ]
        );
    }

    #[test]
    fn test_data_roundtrip_uses_camel_case() {
        let mut record = RelationRecord::new();
        record.insert_server(ServerId::from(3));
        record.stage_store(StoreId(4));

        let envelope = record.to_envelope(StoreId(1)).unwrap();
        assert_eq!(
            envelope.data,
            json!({"serverItems": [3], "storeItems": [4], "deletedItems": []})
        );
        assert_eq!(RelationRecord::from_data(envelope.data).unwrap(), record);
    }
}
