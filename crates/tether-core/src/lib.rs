//! # Tether Core
//!
//! Pure data model for Tether: envelopes, identity triples, and the merge
//! rules that reconcile them.
//!
//! This crate contains no I/O, no storage, no networking. Every other crate
//! in the workspace exchanges [`Envelope`]s built from these types.
//!
//! ## Key Types
//!
//! - [`Envelope`] - The `{ meta, data }` unit exchanged between components
//! - [`Meta`] - Identity triple plus per-request fields
//! - [`Action`] - What an envelope requests or reports
//! - [`RtId`], [`StoreId`], [`ServerId`] - The three identities of an entity
//! - [`RelationRecord`] - Persisted membership of a relationship set
//!
//! ## Identity Merge
//!
//! Known identities are never overwritten; missing ones are filled from the
//! incoming envelope. See [`merge`].

pub mod envelope;
pub mod error;
pub mod merge;
pub mod record;
pub mod relation;
pub mod types;

pub use envelope::{Action, Envelope, Meta};
pub use error::{CoreError, Result};
pub use merge::{adopt_known, fill_missing, LearnedIds};
pub use record::{RecordKeys, DELETED_FIELD};
pub use relation::{MemberRef, RelationRecord};
pub use types::{RtId, ServerId, StoreId, TransactionCounter, TransactionId};
