//! Transaction waiters.
//!
//! A caller interested in one push registers for its transaction id and gets
//! either the reply envelope or the correlated error.

use std::collections::HashMap;

use tether_core::{Envelope, TransactionId};
use tokio::sync::oneshot;

use crate::bus::ErrorEvent;

/// What a waiter eventually receives.
pub type Outcome = std::result::Result<Envelope, ErrorEvent>;

/// Pending waiters keyed by transaction id.
#[derive(Debug, Default)]
pub struct Waiters {
    pending: HashMap<TransactionId, Vec<oneshot::Sender<Outcome>>>,
}

impl Waiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in a transaction.
    pub fn register(&mut self, transaction_id: TransactionId) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        self.pending.entry(transaction_id).or_default().push(tx);
        rx
    }

    /// Deliver a reply to everyone waiting on its transaction.
    pub fn resolve(&mut self, reply: &Envelope) {
        let Some(transaction_id) = reply.meta.transaction_id else {
            return;
        };
        for tx in self.pending.remove(&transaction_id).unwrap_or_default() {
            let _ = tx.send(Ok(reply.clone()));
        }
    }

    /// Deliver an error to everyone waiting on its transaction.
    pub fn reject(&mut self, event: &ErrorEvent) {
        let Some(transaction_id) = event.target.transaction_id else {
            return;
        };
        for tx in self.pending.remove(&transaction_id).unwrap_or_default() {
            let _ = tx.send(Err(event.clone()));
        }
    }

    /// Deliver an outcome decided without the remote peer.
    pub fn settle(&mut self, transaction_id: TransactionId, outcome: Outcome) {
        for tx in self.pending.remove(&transaction_id).unwrap_or_default() {
            let _ = tx.send(outcome.clone());
        }
    }

    /// Hand the waiters of `old` over to `new` (the envelope was superseded).
    pub fn follow(&mut self, old: TransactionId, new: TransactionId) {
        if old == new {
            return;
        }
        if let Some(senders) = self.pending.remove(&old) {
            self.pending.entry(new).or_default().extend(senders);
        }
    }

    /// Number of transactions with at least one waiter.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
