use serde_json::{json, Value};
use std::collections::BTreeMap;
use trxdoc::{Collection, Database, IndexDefinition, QueryOptions, Server, TransactionOptions};

const DOCS: usize = 200;

fn setup() -> (Database, Collection) {
    let server = Server::default();
    let db = server.create_database("rollback").unwrap();
    let users = db.create_collection("users").unwrap();
    users.ensure_index(IndexDefinition::new("email", &["email"]).unique()).unwrap();
    users.ensure_index(IndexDefinition::new("age", &["age"])).unwrap();
    for i in 0..DOCS {
        users
            .insert(json!({"_key": format!("u{}", i), "email": format!("user{}@x", i), "age": i % 50}))
            .unwrap();
    }
    (db, users)
}

fn snapshot(users: &Collection) -> BTreeMap<String, Value> {
    users
        .all()
        .unwrap()
        .into_iter()
        .map(|doc| (doc["_key"].as_str().unwrap().to_string(), doc))
        .collect()
}

#[test]
fn test_abort_restores_everything_after_thousands_of_writes() {
    let (db, users) = setup();
    let before = snapshot(&users);

    let trx = db.begin(TransactionOptions::new().write(["users"])).unwrap();
    let handle = trx.collection("users").unwrap();

    for round in 0..5 {
        for i in 0..DOCS {
            handle
                .update(&format!("u{}", i), json!({"age": round * 100 + i, "round": round}))
                .unwrap();
        }
    }
    for i in 0..1000 {
        handle.insert(json!({"_key": format!("n{}", i), "email": format!("new{}@x", i)})).unwrap();
    }
    for i in 0..DOCS / 2 {
        handle.remove(&format!("u{}", i)).unwrap();
    }
    for i in 0..DOCS / 2 {
        handle
            .insert(json!({"_key": format!("u{}", i), "email": format!("reborn{}@x", i)}))
            .unwrap();
    }
    assert_eq!(handle.count().unwrap(), DOCS + 1000);
    assert_eq!(trx.pending_writes(), DOCS + 1000);

    trx.abort().unwrap();

    assert_eq!(users.count().unwrap(), DOCS);
    assert_eq!(snapshot(&users), before);
    assert_eq!(db.metrics().transactions_aborted, 1);
}

#[test]
fn test_unique_index_is_untouched_by_aborted_writes() {
    let (db, users) = setup();

    let trx = db.begin(TransactionOptions::new().write(["users"])).unwrap();
    let handle = trx.collection("users").unwrap();
    handle.update("u0", json!({"email": "moved@x"})).unwrap();
    handle.update("u1", json!({"email": "user0@x"})).unwrap();
    handle.insert(json!({"_key": "fresh", "email": "fresh@x"})).unwrap();
    assert_eq!(handle.insert(json!({"email": "user2@x"})).unwrap_err().code(), 1210);
    assert_eq!(handle.insert(json!({"email": "user0@x"})).unwrap_err().code(), 1210);
    handle.insert(json!({"_key": "taken", "email": "user1@x"})).unwrap();
    trx.abort().unwrap();

    assert_eq!(users.document("u0").unwrap()["email"], "user0@x");
    assert_eq!(users.insert(json!({"email": "user0@x"})).unwrap_err().code(), 1210);
    users.insert(json!({"_key": "fresh", "email": "fresh@x"})).unwrap();
    users.insert(json!({"email": "moved@x"})).unwrap();
}

#[test]
fn test_email_swap_commits() {
    let (db, users) = setup();

    let trx = db.begin(TransactionOptions::new().write(["users"])).unwrap();
    let handle = trx.collection("users").unwrap();
    handle.update("u0", json!({"email": "swap@x"})).unwrap();
    handle.update("u1", json!({"email": "user0@x"})).unwrap();
    handle.update("u0", json!({"email": "user1@x"})).unwrap();
    trx.commit().unwrap();

    assert_eq!(users.document("u0").unwrap()["email"], "user1@x");
    assert_eq!(users.document("u1").unwrap()["email"], "user0@x");
    assert_eq!(users.insert(json!({"email": "user1@x"})).unwrap_err().code(), 1210);
    users.insert(json!({"email": "swap@x"})).unwrap();
}

#[test]
fn test_truncate_rollback_and_idempotence() {
    let (db, users) = setup();
    let before = snapshot(&users);

    let trx = db.begin(TransactionOptions::new().write(["users"])).unwrap();
    let handle = trx.collection("users").unwrap();
    assert_eq!(handle.truncate().unwrap(), DOCS);
    assert_eq!(handle.truncate().unwrap(), 0);
    assert_eq!(handle.count().unwrap(), 0);
    trx.abort().unwrap();

    assert_eq!(snapshot(&users), before);
}

#[test]
fn test_query_writes_roll_back() {
    let (db, users) = setup();
    let before = snapshot(&users);

    let trx = db.begin(TransactionOptions::new().write(["users"])).unwrap();
    let mut cursor = trx
        .query(
            "FOR u IN users FILTER u.age < 10 UPDATE u WITH {age: u.age + 1000} IN users RETURN NEW.age",
            &Value::Null,
            QueryOptions::default(),
        )
        .unwrap();
    let ages = cursor.collect_all().unwrap();
    assert_eq!(ages.len(), 40);
    assert!(ages.iter().all(|age| age.as_i64().unwrap() >= 1000));
    assert_eq!(cursor.stats().writes_executed, 40);
    drop(cursor);

    trx.abort().unwrap();
    assert_eq!(snapshot(&users), before);
}
