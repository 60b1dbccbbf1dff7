use serde_json::{json, Value};
use trxdoc::{AccessMode, Database, Server, ServerOptions, TransactionOptions};

fn setup() -> Database {
    let server = Server::default();
    let db = server.create_database("options").unwrap();
    db.create_collection("a").unwrap();
    db.create_collection("b").unwrap();
    db
}

fn assert_bad_parameter(db: &Database, config: Value) {
    let err = db.begin_with(&config).unwrap_err();
    assert_eq!(err.code(), 10, "expected BadParameter for {}", config);
}

#[test]
fn test_malformed_configs_are_rejected() {
    let db = setup();
    assert_bad_parameter(&db, json!(null));
    assert_bad_parameter(&db, json!("a"));
    assert_bad_parameter(&db, json!({}));
    assert_bad_parameter(&db, json!({"collections": true}));
    assert_bad_parameter(&db, json!({"collections": {"write": 5}}));
    assert_bad_parameter(&db, json!({"collections": {"read": ["a", 1]}}));
    assert_bad_parameter(&db, json!({"collections": {}, "lockTimeout": -1}));
    assert_bad_parameter(&db, json!({"collections": {}, "lockTimeout": "soon"}));
    assert_bad_parameter(&db, json!({"collections": {}, "waitForSync": "yes"}));
    assert_bad_parameter(&db, json!({"collections": {}, "allowImplicit": 1}));

    assert!(db.list_transactions().is_empty());
    assert_eq!(db.metrics().transactions_begun, 0);
}

#[test]
fn test_unknown_collection_grants_nothing() {
    let db = setup();
    let err = db
        .begin_with(&json!({"collections": {"write": ["a", "missing"]}}))
        .unwrap_err();
    assert_eq!(err.code(), 1203);

    let exclusive = db
        .begin_with(&json!({"collections": {"exclusive": "a"}, "lockTimeout": 0.05}))
        .unwrap();
    exclusive.commit().unwrap();
}

#[test]
fn test_string_and_array_forms() {
    let db = setup();
    let trx = db
        .begin_with(&json!({
            "collections": {"read": "a", "write": ["b"]},
            "waitForSync": true,
            "lockTimeout": 0,
        }))
        .unwrap();

    let intents = trx.collections();
    assert_eq!(intents.get("a"), Some(&AccessMode::Read));
    assert_eq!(intents.get("b"), Some(&AccessMode::Write));
    assert!(trx.options().wait_for_sync);

    trx.collection("b").unwrap().insert(json!({"_key": "k"})).unwrap();
    trx.commit().unwrap();
    assert_eq!(db.metrics().synced_commits, 1);
}

#[test]
fn test_read_intent_cannot_write() {
    let db = setup();
    let trx = db.begin(TransactionOptions::new().read(["a"])).unwrap();
    let err = trx.collection("a").unwrap().insert(json!({})).unwrap_err();
    assert_eq!(err.code(), 1652);
    assert!(trx.is_running());

    let err = trx.collection("b").map(|_| ()).unwrap_err();
    assert_eq!(err.code(), 1652);
    assert!(trx.is_running());
}

#[test]
fn test_strongest_mode_wins() {
    let db = setup();
    let trx = db
        .begin(TransactionOptions::new().read(["a"]).write(["a"]).exclusive(["b"]).read(["b"]))
        .unwrap();
    let intents = trx.collections();
    assert_eq!(intents.get("a"), Some(&AccessMode::Write));
    assert_eq!(intents.get("b"), Some(&AccessMode::Exclusive));
}

#[test]
fn test_huge_lock_timeouts_wait_without_limit() {
    let db = setup();
    let trx = db
        .begin_with(&json!({"collections": {"write": "a"}, "lockTimeout": 1e20}))
        .unwrap();
    trx.collection("a").unwrap().insert(json!({"_key": "k"})).unwrap();
    trx.commit().unwrap();

    let server = Server::new(ServerOptions {
        default_lock_timeout_secs: 1e20,
        ..ServerOptions::default()
    })
    .unwrap();
    let db = server.create_database("huge").unwrap();
    db.create_collection("a").unwrap();
    let trx = db.begin(TransactionOptions::new().exclusive(["a"])).unwrap();
    assert_eq!(trx.collection("a").unwrap().count().unwrap(), 0);
    trx.abort().unwrap();
}
