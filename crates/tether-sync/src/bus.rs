//! Error stream shared by every channel.
//!
//! Failures never cross a component boundary as a panic or a returned error;
//! they are published here so whoever cares can match them against the
//! transaction they are waiting on.

use tether_core::{RtId, TransactionId};
use tokio::sync::broadcast;

/// Default number of buffered events per subscriber.
pub const DEFAULT_CAPACITY: usize = 256;

/// What an error refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorTarget {
    /// Collection or relationship the failing channel serves.
    pub collection: String,
    /// Transaction the failure belongs to, if the request carried one.
    pub transaction_id: Option<TransactionId>,
    /// Entity the failure belongs to.
    pub rt_id: Option<RtId>,
}

/// One correlated error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub target: ErrorTarget,
    pub message: String,
}

impl ErrorEvent {
    pub fn new(
        collection: impl Into<String>,
        transaction_id: Option<TransactionId>,
        rt_id: Option<RtId>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            target: ErrorTarget {
                collection: collection.into(),
                transaction_id,
                rt_id,
            },
            message: message.into(),
        }
    }
}

/// Broadcast stream of [`ErrorEvent`]s.
///
/// Clones publish into the same stream.
#[derive(Debug, Clone)]
pub struct ErrorBus {
    tx: broadcast::Sender<ErrorEvent>,
}

impl ErrorBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ErrorEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Events with no subscriber are dropped.
    pub fn publish(&self, event: ErrorEvent) {
        tracing::warn!(
            collection = %event.target.collection,
            transaction_id = ?event.target.transaction_id,
            rt_id = ?event.target.rt_id,
            "{}",
            event.message
        );
        let _ = self.tx.send(event);
    }
}

impl Default for ErrorBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
