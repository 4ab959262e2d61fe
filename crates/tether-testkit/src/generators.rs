//! Proptest generators for property-based testing.

use proptest::prelude::*;
use serde_json::{json, Value};

use tether::Source;
use tether_core::{Action, Envelope, RtId, ServerId, StoreId};

/// Generate a small runtime id, so generated envelopes collide often.
pub fn rt_id() -> impl Strategy<Value = RtId> {
    (1u64..=8).prop_map(RtId)
}

/// Generate a small store id.
pub fn store_id() -> impl Strategy<Value = StoreId> {
    (1u64..=8).prop_map(StoreId)
}

/// Generate a small numeric server id.
pub fn server_id() -> impl Strategy<Value = ServerId> {
    (1u64..=8).prop_map(ServerId::from)
}

/// Generate entity data: a flat object with a couple of fields.
pub fn data() -> impl Strategy<Value = Value> {
    (any::<u8>(), "[a-z]{0,8}").prop_map(|(n, title)| json!({"n": n, "title": title}))
}

/// Generate an action an external caller or a channel might send.
pub fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        4 => Just(Action::Save),
        1 => Just(Action::Delete),
        1 => Just(Action::DeletePermanently),
        1 => Just(Action::function("count", json!({}))),
    ]
}

/// Generate an envelope source.
pub fn source() -> impl Strategy<Value = Source> {
    prop_oneof![Just(Source::External), Just(Source::Remote), Just(Source::Local)]
}

/// Any subset of the three ids of one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct IdTriple {
    pub rt_id: Option<RtId>,
    pub store_id: Option<StoreId>,
    pub server_id: Option<ServerId>,
}

impl Arbitrary for IdTriple {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (
            prop::option::of(rt_id()),
            prop::option::of(store_id()),
            prop::option::of(server_id()),
        )
            .prop_map(|(rt_id, store_id, server_id)| IdTriple {
                rt_id,
                store_id,
                server_id,
            })
            .boxed()
    }
}

/// Build an envelope carrying exactly the ids of `ids`.
pub fn envelope_for(ids: &IdTriple, action: Action, data: Value) -> Envelope {
    let mut envelope = Envelope::new(data).with_action(action);
    envelope.meta.rt_id = ids.rt_id;
    envelope.meta.store_id = ids.store_id;
    envelope.meta.server_id = ids.server_id.clone();
    envelope
}

/// Generate one registry input: a source and an envelope.
pub fn registry_input() -> impl Strategy<Value = (Source, Envelope)> {
    (source(), any::<IdTriple>(), action(), data())
        .prop_map(|(source, ids, action, data)| (source, envelope_for(&ids, action, data)))
}
