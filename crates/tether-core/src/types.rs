//! Strong type definitions for Tether.
//!
//! Each identity an entity can carry is a newtype so a store key can never be
//! passed where a server key is expected.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-local runtime identity.
///
/// Assigned by the registry the first time an entity is observed and never
/// reassigned for the lifetime of that entity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtId(pub u64);

impl RtId {
    /// Get the raw value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for RtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RtId({})", self.0)
    }
}

impl fmt::Display for RtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RtId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Key assigned by the local store on the first successful write.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreId(pub u64);

impl StoreId {
    /// Get the raw value.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Read a store key out of a JSON value (number or numeric string).
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_u64().map(Self),
            serde_json::Value::String(s) => s.parse().ok().map(Self),
            _ => None,
        }
    }
}

impl fmt::Debug for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreId({})", self.0)
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for StoreId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Key assigned by the remote peer on the first successful create.
///
/// Peers hand out either numeric or string keys; both are kept as text.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(String);

impl ServerId {
    /// Create from any string-like key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Borrow the key as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Read a server key out of a JSON value (number or string).
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => Some(Self(n.to_string())),
            serde_json::Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            _ => None,
        }
    }

    /// Render the key as JSON, numeric when it looks like one.
    pub fn to_value(&self) -> serde_json::Value {
        match self.0.parse::<u64>() {
            Ok(n) => serde_json::Value::from(n),
            Err(_) => serde_json::Value::String(self.0.clone()),
        }
    }
}

impl fmt::Debug for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerId({})", self.0)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for ServerId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for ServerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ServerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Serialize for ServerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ServerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Self::from_value(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid server id: {value}")))
    }
}

/// Correlates one outbound request with its eventual reply or error.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub u64);

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", self.0)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic source of transaction ids.
///
/// Clones share the same counter, so one counter handed to every channel
/// yields ids that are unique across all of them.
#[derive(Debug, Clone, Default)]
pub struct TransactionCounter(Arc<AtomicU64>);

impl TransactionCounter {
    /// Create a counter whose first id is 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next transaction id.
    pub fn next(&self) -> TransactionId {
        TransactionId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}
