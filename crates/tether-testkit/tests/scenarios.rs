//! End-to-end reconciliation scenarios.
//!
//! Each test pins down one behaviour a caller relies on: identity stability,
//! idempotent merges, offline replay, relationship promotion and permanent
//! deletion.

use proptest::prelude::*;
use serde_json::{json, Value};
use tether::sync::Method;
use tether::{Action, Envelope, Registry, RtId, ServerId, Source, StoreId};
use tether_testkit::{registry_input, EngineFixture, FixtureKeys};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

proptest! {
    #[test]
    fn prop_handles_answer_to_their_rt_id(
        inputs in prop::collection::vec(registry_input(), 0..48)
    ) {
        let mut registry = Registry::new("todos");
        let mut assigned = Vec::new();
        for (source, envelope) in inputs {
            if let Some(rt_id) = registry.process(source, envelope).and_then(|r| r.envelope.rt_id()) {
                assigned.push(rt_id);
            }
            for handle in registry.all() {
                let rt_id = handle.rt_id().unwrap();
                prop_assert_eq!(registry.get(rt_id).unwrap().rt_id(), Some(rt_id));
            }
        }
        for rt_id in assigned {
            if let Some(handle) = registry.get(rt_id) {
                prop_assert_eq!(handle.rt_id(), Some(rt_id));
            }
        }
    }
}

#[test]
fn test_complete_envelope_twice_is_one_entity() {
    let mut registry = Registry::new("todos");
    let complete = Envelope::save(json!({"title": "milk"}))
        .with_store_id(StoreId(101))
        .with_server_id(55u64);

    let first = registry.process(Source::Remote, complete.clone()).unwrap();
    let rt_id = first.envelope.rt_id().unwrap();
    let again = complete.with_rt_id(rt_id);
    registry.process(Source::Remote, again.clone()).unwrap();
    registry.process(Source::Remote, again).unwrap();

    assert_eq!(registry.len(), 1);
    let by_rt = registry.get(rt_id).unwrap();
    assert_eq!(registry.get_by_server_id(&ServerId::from(55u64)), Some(by_rt));
    assert_eq!(registry.get_by_store_id(StoreId(101)), Some(by_rt));
}

#[test]
fn test_known_server_id_survives_envelope_without_one() {
    let mut registry = Registry::new("todos");
    registry.process(Source::Remote, Envelope::save(json!({})).with_server_id(9u64));

    let partial = Envelope::save(json!({"title": "eggs"})).with_rt_id(RtId(1));
    registry.process(Source::External, partial).unwrap();

    let handle = registry.get(RtId(1)).unwrap();
    assert_eq!(handle.meta().server_id, Some(ServerId::from(9u64)));
    assert_eq!(handle.data(), &json!({"title": "eggs"}));
}

#[tokio::test]
async fn test_offline_queue_keeps_one_entry_per_entity() {
    init_tracing();
    let mut fixture = EngineFixture::new().await.unwrap();

    let first = fixture.create("todos", json!({"v": 1})).await.unwrap();
    let second = fixture.create("todos", json!({"v": 2})).await.unwrap();
    fixture
        .engine
        .submit("todos", Envelope::save(json!({"v": 3})).with_rt_id(first))
        .await
        .unwrap();

    let queue = fixture.engine.collection("todos").unwrap().remote().queue();
    let queued: Vec<RtId> = queue.iter().map(|(rt_id, _)| *rt_id).collect();
    assert_eq!(queued, vec![first, second]);

    fixture.engine.online().await.unwrap();
    let bodies: Vec<Value> = fixture
        .server
        .requests()
        .await
        .into_iter()
        .filter(|request| request.method == Method::Post)
        .filter_map(|request| request.body)
        .collect();
    assert_eq!(bodies, vec![json!({"v": 3}), json!({"v": 2})]);
}

#[tokio::test]
async fn test_store_only_member_promoted_exactly_once() {
    init_tracing();
    let keys = FixtureKeys {
        todo_store: 60,
        todo_server: 500,
        ..FixtureKeys::default()
    };
    let mut fixture = EngineFixture::with_keys(keys).await.unwrap();
    fixture.engine.online().await.unwrap();
    let list = fixture.create("lists", json!({"name": "groceries"})).await.unwrap();

    fixture.engine.offline().await.unwrap();
    let todo = fixture.create("todos", json!({"title": "milk"})).await.unwrap();
    fixture.engine.relate("lists.items", list, todo).await.unwrap();
    let set = fixture.engine.relation("lists.items", list).unwrap();
    assert_eq!(set.record().store_items, vec![StoreId(60)]);

    fixture.engine.online().await.unwrap();
    fixture.engine.fetch("todos").await.unwrap();

    let set = fixture.engine.relation("lists.items", list).unwrap();
    assert!(set.record().store_items.is_empty());
    assert_eq!(set.record().server_items, vec![ServerId::from(500u64)]);
    assert_eq!(fixture.server.count(Method::Put).await, 1);
    assert_eq!(
        fixture.server.members("/lists", "10", "items").await,
        vec!["500".to_string()]
    );

    let stored = fixture.memberships.peek(StoreId(201)).unwrap();
    assert_eq!(stored["serverItems"], json!([500]));
    assert_eq!(stored["storeItems"], json!([]));
}

#[tokio::test]
async fn test_deleted_entity_is_gone_for_good() {
    init_tracing();
    let mut fixture = EngineFixture::new().await.unwrap();
    fixture.engine.online().await.unwrap();
    let todo = fixture.create("todos", json!({"title": "milk"})).await.unwrap();

    let delete = Envelope::new(Value::Null)
        .with_action(Action::Delete)
        .with_rt_id(todo);
    fixture.engine.submit("todos", delete).await.unwrap();

    assert!(fixture.todo(todo).is_none());
    let todos = fixture.engine.collection("todos").unwrap();
    assert!(todos.get_by_store_id(StoreId(101)).is_none());
    assert!(todos.get_by_server_id(&ServerId::from(55u64)).is_none());
    assert!(fixture.todos.is_empty());

    let mut downstream = fixture.engine.subscribe("todos").unwrap();
    let late = Envelope::save(json!({"title": "late"})).with_rt_id(todo);
    fixture.engine.submit("todos", late).await.unwrap();
    assert!(downstream.try_recv().is_err());
    assert!(fixture.todo(todo).is_none());
}

#[tokio::test]
async fn test_new_item_gets_store_then_server_id() {
    init_tracing();
    let mut fixture = EngineFixture::new().await.unwrap();
    let mut downstream = fixture.engine.subscribe("todos").unwrap();

    let rt_id = fixture.create("todos", json!({"title": "milk"})).await.unwrap();
    assert_eq!(rt_id, RtId(1));
    assert_eq!(fixture.todo(rt_id).unwrap().meta().store_id, Some(StoreId(101)));
    assert!(fixture.todo(rt_id).unwrap().meta().server_id.is_none());

    fixture.engine.online().await.unwrap();

    let todos = fixture.engine.collection("todos").unwrap();
    let handle = todos.get(RtId(1)).unwrap();
    assert_eq!(handle.meta().store_id, Some(StoreId(101)));
    assert_eq!(handle.meta().server_id, Some(ServerId::from(55u64)));
    assert_eq!(todos.get_by_store_id(StoreId(101)), Some(handle));
    assert_eq!(todos.get_by_server_id(&ServerId::from(55u64)), Some(handle));
    assert_eq!(
        fixture.todos.peek(StoreId(101)),
        Some(json!({"title": "milk", "_id": 101, "id": 55}))
    );

    let mut seen = Vec::new();
    while let Ok(envelope) = downstream.try_recv() {
        seen.push((envelope.store_id(), envelope.server_id().cloned()));
    }
    assert_eq!(seen.first(), Some(&(None, None)));
    assert_eq!(
        seen.last(),
        Some(&(Some(StoreId(101)), Some(ServerId::from(55u64))))
    );
}
