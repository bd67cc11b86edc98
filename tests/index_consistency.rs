//! Property tests: indexes track the document set through any mutation
//! sequence, and undo walks back to the starting state.

use localdb::{
    default_comparator, CollectionConfig, Db, DbConfig, DbError, Document, FieldConfig, FieldKind,
    IndexDirection, Patch, TxOptions,
};
use proptest::prelude::*;
use serde_json::{json, Map, Value};

#[derive(Clone, Debug)]
enum Op {
    Set { id: u8, age: Option<Value> },
    Update { id: u8, age: Option<Value> },
    Delete { id: u8 },
    Batch { ids: Vec<u8> },
    Failing { id: u8, age: Option<Value> },
}

fn age_strategy() -> impl Strategy<Value = Option<Value>> {
    prop_oneof![
        6 => (0i64..5).prop_map(|n| Some(json!(n))),
        1 => Just(Some(Value::Null)),
        1 => Just(None),
    ]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..8, age_strategy()).prop_map(|(id, age)| Op::Set { id, age }),
        (0u8..8, age_strategy()).prop_map(|(id, age)| Op::Update { id, age }),
        (0u8..8).prop_map(|id| Op::Delete { id }),
        prop::collection::vec(0u8..8, 0..4).prop_map(|ids| Op::Batch { ids }),
        (0u8..8, age_strategy()).prop_map(|(id, age)| Op::Failing { id, age }),
    ]
}

fn person_db(direction: IndexDirection) -> Db {
    let db = Db::new(DbConfig::default()).unwrap();
    db.define_collection(
        "person",
        CollectionConfig::new().field("age", FieldConfig::number().nullable().index(direction)),
        None,
    )
    .unwrap();
    db
}

fn make_doc(id: u8, age: &Option<Value>) -> Document {
    let mut fields = Map::new();
    fields.insert("id".into(), json!(format!("p{id}")));
    if let Some(age) = age {
        fields.insert("age".into(), age.clone());
    }
    Document::new(fields)
}

fn age_patch(age: &Option<Value>) -> Patch {
    match age {
        Some(age) => Patch::new().set("age", age.clone()),
        None => Patch::new().unset("age"),
    }
}

fn apply(db: &Db, op: &Op, options: Option<TxOptions>) {
    let tolerant = Some(options.clone().unwrap_or_default().ignore_not_found().idempotent());
    match op {
        Op::Set { id, age } => db.set_doc("person", make_doc(*id, age), options).unwrap(),
        Op::Update { id, age } => db
            .update_doc("person", &format!("p{id}"), age_patch(age), tolerant)
            .unwrap(),
        Op::Delete { id } => db
            .delete_doc("person", &format!("p{id}"), tolerant)
            .unwrap(),
        Op::Batch { ids } => db
            .delete_docs(
                "person",
                ids.iter().map(|id| format!("p{id}")).collect(),
                tolerant,
            )
            .unwrap(),
        Op::Failing { id, age } => {
            let result: localdb::Result<()> = db.tx(options, |db| {
                db.set_doc("person", make_doc(*id, age), None)?;
                Err(DbError::Aborted("property".into()))
            });
            assert!(result.is_err());
        }
    }
}

fn assert_index_matches(db: &Db, direction: IndexDirection) {
    let indexed = db.docs_order_by("person", "age").unwrap();

    let mut expected: Vec<Document> = db.collection("person").unwrap().docs().cloned().collect();
    let compare = default_comparator(FieldKind::Number, direction).unwrap();
    expected.sort_by(|a, b| compare(a.get("age"), b.get("age")));

    let keys = |docs: &[Document]| -> Vec<Option<Value>> {
        docs.iter().map(|d| d.get("age").cloned()).collect()
    };
    assert_eq!(keys(&indexed), keys(&expected));

    let mut indexed_ids: Vec<&str> = indexed.iter().map(|d| d.id().unwrap()).collect();
    let mut expected_ids: Vec<&str> = expected.iter().map(|d| d.id().unwrap()).collect();
    indexed_ids.sort();
    expected_ids.sort();
    assert_eq!(indexed_ids, expected_ids);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_index_matches_resort(ops in prop::collection::vec(op_strategy(), 1..40), desc in any::<bool>()) {
        let direction = if desc { IndexDirection::Desc } else { IndexDirection::Asc };
        let db = person_db(direction);
        for op in &ops {
            apply(&db, op, None);
            assert_index_matches(&db, direction);
        }
    }

    #[test]
    fn test_undo_all_restores_start(ops in prop::collection::vec(op_strategy(), 1..20)) {
        let db = person_db(IndexDirection::Asc);
        db.set_docs(
            "person",
            (0..4).map(|id| make_doc(id, &Some(json!(id)))).collect(),
            None,
        )
        .unwrap();
        let start = db.snapshot();

        let mut states = vec![db.snapshot()];
        for op in &ops {
            apply(&db, op, Some(TxOptions::new().undoable()));
            if !db.equals(states.last().unwrap()) {
                states.push(db.snapshot());
            }
        }
        prop_assert_eq!(db.history_len(), states.len() - 1);

        while db.can_undo() {
            db.undo().unwrap();
            states.pop();
            prop_assert!(db.equals(states.last().unwrap()));
            assert_index_matches(&db, IndexDirection::Asc);
        }
        prop_assert!(db.equals(&start));
    }
}
