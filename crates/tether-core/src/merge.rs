//! Identity merge: fill missing, never overwrite known.
//!
//! This is the single tie-break rule for conflicting metadata. A known
//! record keeps every identity it already has; an identity it lacks is
//! adopted from the incoming envelope. A slow server reply therefore cannot
//! clobber a key the local store already assigned, and vice versa.

use crate::envelope::{Envelope, Meta};
use crate::types::{RtId, ServerId, StoreId};

/// Identities a known record adopted during a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LearnedIds {
    pub rt_id: Option<RtId>,
    pub store_id: Option<StoreId>,
    pub server_id: Option<ServerId>,
}

impl LearnedIds {
    /// Whether the merge taught the known record nothing new.
    pub fn is_empty(&self) -> bool {
        self.rt_id.is_none() && self.store_id.is_none() && self.server_id.is_none()
    }
}

/// Fill the identities `known` lacks from `incoming`.
///
/// `deleted` is OR-combined. Per-request fields are left untouched.
pub fn fill_missing(known: &mut Meta, incoming: &Meta) -> LearnedIds {
    let mut learned = LearnedIds::default();

    if known.rt_id.is_none() {
        if let Some(rt_id) = incoming.rt_id {
            known.rt_id = Some(rt_id);
            learned.rt_id = Some(rt_id);
        }
    }

    if known.store_id.is_none() {
        if let Some(store_id) = incoming.store_id {
            known.store_id = Some(store_id);
            learned.store_id = Some(store_id);
        }
    }

    if known.server_id.is_none() {
        if let Some(server_id) = &incoming.server_id {
            known.server_id = Some(server_id.clone());
            learned.server_id = Some(server_id.clone());
        }
    }

    known.deleted |= incoming.deleted;
    learned
}

/// Replace the envelope's metadata with the known record's.
///
/// `action`, `transaction_id` and `server_data` belong to the request and
/// survive the replacement.
pub fn adopt_known(envelope: &mut Envelope, known: &Meta) {
    let action = envelope.meta.action.take();
    let transaction_id = envelope.meta.transaction_id.take();
    let server_data = envelope.meta.server_data.take();

    envelope.meta = known.resting();
    envelope.meta.action = action;
    envelope.meta.transaction_id = transaction_id;
    envelope.meta.server_data = server_data;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Action;
    use crate::types::TransactionId;
    use proptest::prelude::*;
    use serde_json::json;

    fn meta(rt: Option<u64>, store: Option<u64>, server: Option<u64>) -> Meta {
        Meta {
            rt_id: rt.map(RtId),
            store_id: store.map(StoreId),
            server_id: server.map(ServerId::from),
            ..Meta::default()
        }
    }

    #[test]
    fn test_known_server_id_is_not_overwritten() {
        let mut known = meta(Some(1), None, Some(9));
        let incoming = meta(Some(1), Some(101), None);

        let learned = fill_missing(&mut known, &incoming);

        assert_eq!(known.server_id, Some(ServerId::from(9)));
        assert_eq!(known.store_id, Some(StoreId(101)));
        assert_eq!(learned.store_id, Some(StoreId(101)));
        assert!(learned.server_id.is_none());
    }

    #[test]
    fn test_conflicting_server_id_keeps_known_value() {
        let mut known = meta(Some(1), None, Some(9));
        let incoming = meta(Some(1), None, Some(10));

        let learned = fill_missing(&mut known, &incoming);

        assert_eq!(known.server_id, Some(ServerId::from(9)));
        assert!(learned.is_empty());
    }

    #[test]
    fn test_deleted_is_or_combined() {
        let mut known = meta(Some(1), None, None);
        let mut incoming = meta(Some(1), None, None);
        incoming.deleted = true;
        fill_missing(&mut known, &incoming);
        assert!(known.deleted);

        incoming.deleted = false;
        fill_missing(&mut known, &incoming);
        assert!(known.deleted);
    }

    #[test]
    fn test_adopt_known_preserves_request_fields() {
        let known = meta(Some(3), Some(7), Some(70));
        let mut envelope = Envelope::new(json!({"a": 1}))
            .with_action(Action::Delete)
            .with_transaction_id(TransactionId(12))
            .with_server_id(99u64);

        adopt_known(&mut envelope, &known);

        assert_eq!(envelope.meta.rt_id, Some(RtId(3)));
        assert_eq!(envelope.meta.server_id, Some(ServerId::from(70)));
        assert_eq!(envelope.meta.action, Some(Action::Delete));
        assert_eq!(envelope.meta.transaction_id, Some(TransactionId(12)));
    }

    fn id() -> impl Strategy<Value = Option<u64>> {
        prop::option::of(1u64..1000)
    }

    proptest! {
        #[test]
        fn test_fill_missing_never_overwrites(
            k in (id(), id(), id()),
            i in (id(), id(), id()),
        ) {
            let before = meta(k.0, k.1, k.2);
            let mut known = before.clone();
            fill_missing(&mut known, &meta(i.0, i.1, i.2));

            if before.rt_id.is_some() {
                prop_assert_eq!(known.rt_id, before.rt_id);
            }
            if before.store_id.is_some() {
                prop_assert_eq!(known.store_id, before.store_id);
            }
            if before.server_id.is_some() {
                prop_assert_eq!(&known.server_id, &before.server_id);
            }
        }

        #[test]
        fn test_fill_missing_is_idempotent(
            k in (id(), id(), id()),
            i in (id(), id(), id()),
        ) {
            let incoming = meta(i.0, i.1, i.2);
            let mut known = meta(k.0, k.1, k.2);
            fill_missing(&mut known, &incoming);
            let once = known.clone();

            let learned = fill_missing(&mut known, &incoming);
            prop_assert!(learned.is_empty());
            prop_assert_eq!(known, once);
        }
    }
}
