//! Conversion between envelopes and raw local-store records.
//!
//! A stored record is the envelope's `data` object with the store key and the
//! server key written into configurable fields. The runtime id is never
//! persisted; it only means something inside one process.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::envelope::{Envelope, Meta};
use crate::error::{CoreError, Result};
use crate::types::{ServerId, StoreId};

/// Field holding the soft-delete flag in stored records.
pub const DELETED_FIELD: &str = "_deleted";

/// Names of the key fields in a stored record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordKeys {
    /// Field holding the local store key.
    pub local_key: String,
    /// Field holding the server key.
    pub remote_key: String,
}

impl Default for RecordKeys {
    fn default() -> Self {
        Self {
            local_key: "_id".to_string(),
            remote_key: "id".to_string(),
        }
    }
}

impl RecordKeys {
    pub fn new(local_key: impl Into<String>, remote_key: impl Into<String>) -> Self {
        Self {
            local_key: local_key.into(),
            remote_key: remote_key.into(),
        }
    }

    /// Flatten an envelope into a store record.
    pub fn encode(&self, envelope: &Envelope) -> Result<Value> {
        let mut record = match &envelope.data {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(CoreError::InvalidRecord(format!(
                    "data must be an object, got {other}"
                )))
            }
        };

        match envelope.meta.store_id {
            Some(store_id) => {
                record.insert(self.local_key.clone(), Value::from(store_id.get()));
            }
            None => {
                record.remove(&self.local_key);
            }
        }
        match &envelope.meta.server_id {
            Some(server_id) => {
                record.insert(self.remote_key.clone(), server_id.to_value());
            }
            None => {
                record.remove(&self.remote_key);
            }
        }
        if envelope.meta.deleted {
            record.insert(DELETED_FIELD.to_string(), Value::Bool(true));
        } else {
            record.remove(DELETED_FIELD);
        }

        Ok(Value::Object(record))
    }

    /// Split a store record back into an envelope (no action, no runtime id).
    pub fn decode(&self, record: Value) -> Result<Envelope> {
        let Value::Object(mut map) = record else {
            return Err(CoreError::InvalidRecord("record is not an object".into()));
        };

        let store_id = match map.remove(&self.local_key) {
            Some(value) => Some(StoreId::from_value(&value).ok_or_else(|| {
                CoreError::InvalidKey {
                    field: self.local_key.clone(),
                    value: value.to_string(),
                }
            })?),
            None => None,
        };
        let server_id = map
            .remove(&self.remote_key)
            .and_then(|value| ServerId::from_value(&value));
        let deleted = matches!(map.remove(DELETED_FIELD), Some(Value::Bool(true)));

        Ok(Envelope {
            meta: Meta {
                store_id,
                server_id,
                deleted,
                ..Meta::default()
            },
            data: Value::Object(map),
        })
    }

    /// Read the store key out of a record without decoding the rest.
    pub fn store_id_of(&self, record: &Value) -> Option<StoreId> {
        record.get(&self.local_key).and_then(StoreId::from_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RtId;
    use serde_json::json;

    #[test]
    fn test_encode_writes_keys_and_drops_rt_id() {
        let keys = RecordKeys::default();
        let envelope = Envelope::save(json!({"title": "milk"}))
            .with_rt_id(RtId(1))
            .with_store_id(StoreId(101))
            .with_server_id(55u64);

        let record = keys.encode(&envelope).unwrap();
        assert_eq!(record, json!({"title": "milk", "_id": 101, "id": 55}));
    }

    #[test]
    fn test_decode_restores_identity_and_deleted() {
        let keys = RecordKeys::new("key", "remoteId");
        let envelope = keys
            .decode(json!({"key": 3, "remoteId": "abc", "_deleted": true, "n": 1}))
            .unwrap();

        assert_eq!(envelope.store_id(), Some(StoreId(3)));
        assert_eq!(envelope.server_id(), Some(&ServerId::from("abc")));
        assert!(envelope.meta.deleted);
        assert!(envelope.rt_id().is_none());
        assert_eq!(envelope.data, json!({"n": 1}));
    }

    #[test]
    fn test_encode_rejects_scalar_data() {
        let keys = RecordKeys::default();
        assert!(keys.encode(&Envelope::new(json!(5))).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_store_key() {
        let keys = RecordKeys::default();
        let err = keys.decode(json!({"_id": true})).unwrap_err();
        assert!(matches!(err, CoreError::InvalidKey { .. }));
    }
}
