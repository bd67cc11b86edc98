//! Integration tests for the document store.

use localdb::{
    CollectionConfig, CollectionUpdate, Db, DbConfig, DocUpdate, Document, FieldConfig,
    ForeignComputeRule, IndexDirection, Patch, Query, TxOptions,
};
use serde_json::{json, Map, Value};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

fn doc(value: Value) -> Document {
    Document::from_value(value).unwrap()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

fn person_db() -> Db {
    init_tracing();
    let db = Db::new(DbConfig::default()).unwrap();
    db.define_collection(
        "person",
        CollectionConfig::new()
            .field("name", FieldConfig::string().index(IndexDirection::Asc))
            .field("age", FieldConfig::number().nullable().index(IndexDirection::Asc)),
        Some(vec![
            doc(json!({"id": "p1", "age": 10})),
            doc(json!({"id": "p2", "age": 18})),
        ]),
    )
    .unwrap();
    db
}

fn age(db: &Db, id: &str) -> Option<Value> {
    db.doc("person", id)
        .unwrap()
        .and_then(|d| d.get("age").cloned())
}

fn ids(docs: &[Document]) -> Vec<&str> {
    docs.iter().map(|d| d.id().unwrap()).collect()
}

// --- Realistic Workflow Tests ---

#[test]
fn test_update_notify_undo_redo() {
    let db = person_db();
    let doc_calls = Rc::new(RefCell::new(Vec::new()));
    let field_calls = Rc::new(RefCell::new(Vec::new()));

    let calls = doc_calls.clone();
    db.subscribe_doc("person", "p1", move |_db, event| {
        calls.borrow_mut().push((
            event.next.cloned(),
            event.prev.cloned(),
            event.change.cloned(),
        ));
    });

    let calls = field_calls.clone();
    db.subscribe_field("person", "p1", "age", move |_db, event| {
        calls.borrow_mut().push((
            event.next.cloned(),
            event.prev.cloned(),
            event.next_doc.cloned(),
            event.prev_doc.cloned(),
        ));
    });

    db.update_doc(
        "person",
        "p1",
        Patch::new().set("age", 11),
        Some(TxOptions::new().undoable()),
    )
    .unwrap();

    let p1_10 = doc(json!({"id": "p1", "age": 10}));
    let p1_11 = doc(json!({"id": "p1", "age": 11}));
    assert_eq!(db.doc("person", "p1").unwrap(), Some(p1_11.clone()));

    assert_eq!(
        doc_calls.borrow().as_slice(),
        &[(
            Some(p1_11.clone()),
            Some(p1_10.clone()),
            Some(Patch::new().set("age", 11))
        )]
    );
    assert_eq!(
        field_calls.borrow().as_slice(),
        &[(
            Some(json!(11)),
            Some(json!(10)),
            Some(p1_11.clone()),
            Some(p1_10.clone())
        )]
    );

    db.undo().unwrap();
    assert_eq!(db.doc("person", "p1").unwrap(), Some(p1_10));
    assert!(db.can_redo());
    assert!(!db.can_undo());

    db.redo().unwrap();
    assert_eq!(db.doc("person", "p1").unwrap(), Some(p1_11));
    assert_eq!(doc_calls.borrow().len(), 3);
}

#[test]
fn test_owner_and_cars_stay_in_sync() {
    let db = Db::new(DbConfig::default()).unwrap();

    // car.owner -> person.cars
    db.define_collection(
        "car",
        CollectionConfig::new()
            .field("owner", FieldConfig::string().nullable())
            .foreign_compute(ForeignComputeRule::new(&["person"], |db, changes| {
                let mut patches: BTreeMap<String, Patch> = BTreeMap::new();
                for change in changes {
                    let car_id = change
                        .next
                        .as_ref()
                        .or(change.prev.as_ref())
                        .and_then(|d| d.id())
                        .unwrap_or_default()
                        .to_string();
                    let before = change.prev.as_ref().and_then(|d| d.get("owner")).cloned();
                    let after = change.next.as_ref().and_then(|d| d.get("owner")).cloned();
                    if before == after {
                        continue;
                    }
                    let person = db.collection("person")?;
                    let mut edit = |owner: &Value, add: bool| {
                        let Some(owner) = owner.as_str() else { return };
                        let cars = patches
                            .get(owner)
                            .and_then(|p| p.get("cars").cloned().flatten())
                            .or_else(|| person.get(owner).and_then(|d| d.get("cars").cloned()))
                            .unwrap_or_else(|| json!([]));
                        let mut cars: Vec<Value> = cars.as_array().cloned().unwrap_or_default();
                        cars.retain(|c| c != &json!(car_id));
                        if add {
                            cars.push(json!(car_id));
                        }
                        patches.insert(owner.to_string(), Patch::new().set("cars", cars));
                    };
                    if let Some(owner) = &before {
                        edit(owner, false);
                    }
                    if let Some(owner) = &after {
                        edit(owner, true);
                    }
                }
                db.update_docs("person", patches, Some(TxOptions::new().ignore_not_found()))
            })),
        None,
    )
    .unwrap();

    db.define_collection(
        "person",
        CollectionConfig::new().field("cars", FieldConfig::new(localdb::FieldKind::Array)),
        Some(vec![
            doc(json!({"id": "ann", "cars": []})),
            doc(json!({"id": "bob", "cars": []})),
        ]),
    )
    .unwrap();

    let cars = |db: &Db, id: &str| db.doc("person", id).unwrap().unwrap().get("cars").cloned();

    db.set_doc(
        "car",
        doc(json!({"id": "c1", "owner": "ann"})),
        Some(TxOptions::new().undoable()),
    )
    .unwrap();
    assert_eq!(cars(&db, "ann"), Some(json!(["c1"])));

    db.update_doc(
        "car",
        "c1",
        Patch::new().set("owner", "bob"),
        Some(TxOptions::new().undoable()),
    )
    .unwrap();
    assert_eq!(cars(&db, "ann"), Some(json!([])));
    assert_eq!(cars(&db, "bob"), Some(json!(["c1"])));

    // One history entry covers the car and both people
    db.undo().unwrap();
    assert_eq!(cars(&db, "ann"), Some(json!(["c1"])));
    assert_eq!(cars(&db, "bob"), Some(json!([])));

    db.redo().unwrap();
    assert_eq!(cars(&db, "bob"), Some(json!(["c1"])));

    db.delete_doc("car", "c1", None).unwrap();
    assert_eq!(cars(&db, "bob"), Some(json!([])));
}

#[test]
fn test_grouped_transaction_notifies_once() {
    let db = person_db();
    let passes = Rc::new(RefCell::new(0));
    let counter = passes.clone();
    db.subscribe_db(move |_db, _event| *counter.borrow_mut() += 1);

    db.tx(None, |db| -> localdb::Result<()> {
        db.update_doc("person", "p1", Patch::new().set("age", 1), None)?;
        db.update_doc("person", "p2", Patch::new().set("age", 2), None)?;
        db.set_doc("person", doc(json!({"id": "p3", "age": 3})), None)?;
        Ok(())
    })
    .unwrap();

    assert_eq!(*passes.borrow(), 1);
    assert_eq!(db.collection("person").unwrap().len(), 3);
}

#[test]
fn test_listener_order_and_context() {
    let db = person_db();
    let log = Rc::new(RefCell::new(Vec::new()));

    let l = log.clone();
    db.subscribe_db(move |_db, event| {
        l.borrow_mut().push(format!("db:{}", event.context["source"]));
    });
    let l = log.clone();
    db.subscribe_collection("person", move |_db, event| {
        l.borrow_mut().push(format!("collection:{}", event.context["source"]));
    });
    let l = log.clone();
    db.subscribe_doc("person", "p1", move |_db, event| {
        l.borrow_mut().push(format!("doc:{}", event.context["source"]));
    });
    let l = log.clone();
    db.subscribe_field("person", "p1", "age", move |_db, event| {
        l.borrow_mut().push(format!("field:{}", event.context["source"]));
    });

    let mut context = Map::new();
    context.insert("source".into(), json!("sync"));
    db.update_doc(
        "person",
        "p1",
        Patch::new().set("age", 12),
        Some(TxOptions::new().with_context(context)),
    )
    .unwrap();

    assert_eq!(
        log.borrow().as_slice(),
        &[
            "field:\"sync\"",
            "doc:\"sync\"",
            "collection:\"sync\"",
            "db:\"sync\""
        ]
    );
}

#[test]
fn test_no_event_suppresses_notification() {
    let db = person_db();
    let passes = Rc::new(RefCell::new(0));
    let counter = passes.clone();
    db.subscribe_collection("person", move |_db, _event| *counter.borrow_mut() += 1);

    db.update_doc(
        "person",
        "p1",
        Patch::new().set("age", 50),
        Some(TxOptions::new().no_event()),
    )
    .unwrap();

    assert_eq!(*passes.borrow(), 0);
    assert_eq!(age(&db, "p1"), Some(json!(50)));
}

// --- Change Completeness Tests ---

#[test]
fn test_field_listener_fires_only_on_its_field() {
    let db = person_db();
    let fired = Rc::new(RefCell::new(0));
    let counter = fired.clone();
    db.subscribe_field("person", "p1", "name", move |_db, _event| {
        *counter.borrow_mut() += 1
    });

    db.update_doc("person", "p1", Patch::new().set("age", 99), None)
        .unwrap();
    assert_eq!(*fired.borrow(), 0);

    db.update_doc("person", "p1", Patch::new().set("name", "Ann"), None)
        .unwrap();
    assert_eq!(*fired.borrow(), 1);
}

#[test]
fn test_noop_batch_is_silent() {
    let db = person_db();
    let fired = Rc::new(RefCell::new(0));
    let counter = fired.clone();
    db.subscribe_db(move |_db, _event| *counter.borrow_mut() += 1);

    let mut patches = BTreeMap::new();
    patches.insert("p1".to_string(), Patch::new().set("age", 10));
    patches.insert("p2".to_string(), Patch::new().set("age", 18));
    db.update_docs("person", patches, None).unwrap();

    db.update_docs("person", CollectionUpdate::with(|_| None), None)
        .unwrap();
    db.update_doc("person", "p1", DocUpdate::with(|_| None), None)
        .unwrap();

    assert_eq!(*fired.borrow(), 0);
}

#[test]
fn test_doc_listener_sees_delete() {
    let db = person_db();
    let seen = Rc::new(RefCell::new(None));
    let slot = seen.clone();
    db.subscribe_doc("person", "p2", move |_db, event| {
        *slot.borrow_mut() = Some((event.next.is_none(), event.prev.cloned()));
    });

    db.delete_doc("person", "p2", None).unwrap();
    assert_eq!(
        *seen.borrow(),
        Some((true, Some(doc(json!({"id": "p2", "age": 18})))))
    );
}

#[test]
fn test_unsubscribe() {
    let db = person_db();
    let fired = Rc::new(RefCell::new(0));
    let counter = fired.clone();
    let id = db.subscribe_collection("person", move |_db, _event| *counter.borrow_mut() += 1);

    db.update_doc("person", "p1", Patch::new().set("age", 1), None)
        .unwrap();
    assert!(db.unsubscribe(id));
    assert!(!db.unsubscribe(id));
    db.update_doc("person", "p1", Patch::new().set("age", 2), None)
        .unwrap();

    assert_eq!(*fired.borrow(), 1);
}

#[test]
fn test_listener_mutation_is_replayed_after_pass() {
    let db = person_db();
    let observed = Rc::new(RefCell::new(Vec::new()));

    // Keep p2 one year older than p1
    db.subscribe_field("person", "p1", "age", |db, event| {
        let next = event.next.and_then(Value::as_i64).unwrap_or(0);
        db.update_doc("person", "p2", Patch::new().set("age", next + 1), None)
            .unwrap();
    });
    let log = observed.clone();
    db.subscribe_db(move |db, _event| {
        log.borrow_mut().push(age(db, "p2"));
    });

    db.update_doc("person", "p1", Patch::new().set("age", 30), None)
        .unwrap();

    assert_eq!(age(&db, "p2"), Some(json!(31)));
    assert_eq!(
        observed.borrow().as_slice(),
        &[Some(json!(18)), Some(json!(31))]
    );
}

// --- Read Tests ---

#[test]
fn test_batch_read_keeps_order_and_holes() {
    let db = person_db();
    let docs = db.docs("person", &["p2", "missing", "p1"]).unwrap();
    assert_eq!(docs.len(), 3);
    assert_eq!(docs[0].as_ref().and_then(|d| d.id()), Some("p2"));
    assert!(docs[1].is_none());
    assert_eq!(docs[2].as_ref().and_then(|d| d.id()), Some("p1"));
}

#[test]
fn test_range_queries() {
    let db = person_db();
    db.set_docs(
        "person",
        (3..=6)
            .map(|i| doc(json!({"id": format!("p{i}"), "age": i * 10})))
            .collect(),
        None,
    )
    .unwrap();
    db.set_doc("person", doc(json!({"id": "nil", "age": null})), None)
        .unwrap();
    db.set_doc("person", doc(json!({"id": "none"})), None)
        .unwrap();

    let all = db.docs_order_by("person", "age").unwrap();
    assert_eq!(
        ids(&all),
        vec!["p1", "p2", "p3", "p4", "p5", "p6", "nil", "none"]
    );

    let q = Query::new("person", "age").start_at(30).end_at(50);
    assert_eq!(ids(&db.query(&q).unwrap()), vec!["p3", "p4", "p5"]);

    let q = Query::new("person", "age").start_after(30).end_after(50);
    assert_eq!(ids(&db.query(&q).unwrap()), vec!["p4"]);

    let q = Query::new("person", "age").start_after(18).limit(2);
    assert_eq!(ids(&db.query(&q).unwrap()), vec!["p3", "p4"]);
    assert_eq!(db.count(&Query::new("person", "age").start_at(40)).unwrap(), 5);
}

#[test]
fn test_descending_index() {
    let db = Db::new(DbConfig::default()).unwrap();
    db.define_collection(
        "score",
        CollectionConfig::new().field("points", FieldConfig::number().index(IndexDirection::Desc)),
        Some(vec![
            doc(json!({"id": "a", "points": 1})),
            doc(json!({"id": "b"})),
            doc(json!({"id": "c", "points": 3})),
            doc(json!({"id": "d", "points": 2})),
        ]),
    )
    .unwrap();

    let ordered = db.docs_order_by("score", "points").unwrap();
    assert_eq!(ids(&ordered), vec!["c", "d", "a", "b"]);

    let q = Query::new("score", "points").start_at(2);
    assert_eq!(ids(&db.query(&q).unwrap()), vec!["d", "a", "b"]);
}

#[test]
fn test_snapshot_is_isolated_from_later_writes() {
    let db = person_db();
    let before = db.snapshot();
    let p1_before = db.doc("person", "p1").unwrap().unwrap();

    db.update_doc("person", "p1", Patch::new().set("age", 77), None)
        .unwrap();

    assert_eq!(p1_before.get("age"), Some(&json!(10)));
    assert_eq!(
        before.get("person").unwrap().get("p1").unwrap().get("age"),
        Some(&json!(10))
    );
    assert!(!db.equals(&before));
    assert_eq!(db.to_json()["person"]["p1"]["age"], json!(77));
}
