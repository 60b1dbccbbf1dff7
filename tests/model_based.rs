use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use trxdoc::{Server, TransactionOptions, TxCollection};

type Model = BTreeMap<String, Map<String, Value>>;

const KEYS: usize = 20;

fn strip(doc: &Value) -> (String, Map<String, Value>) {
    let mut obj = doc.as_object().cloned().unwrap();
    let key = obj.remove("_key").unwrap().as_str().unwrap().to_string();
    obj.remove("_id");
    obj.remove("_rev");
    (key, obj)
}

fn observed(docs: Vec<Value>) -> Model {
    docs.iter().map(strip).collect()
}

fn payload(rng: &mut StdRng) -> Map<String, Value> {
    let mut obj = Map::new();
    obj.insert("v".to_string(), json!(rng.gen_range(0..1000)));
    if rng.gen_bool(0.5) {
        obj.insert("tag".to_string(), json!(format!("t{}", rng.gen_range(0..5))));
    }
    obj
}

fn random_op(rng: &mut StdRng, handle: &TxCollection<'_>, staged: &mut Model) {
    let key = format!("k{}", rng.gen_range(0..KEYS));
    let body = payload(rng);

    match rng.gen_range(0..100) {
        0..=34 => {
            let mut doc = body.clone();
            doc.insert("_key".to_string(), json!(key));
            match handle.insert(Value::Object(doc)) {
                Ok(_) => {
                    assert!(!staged.contains_key(&key), "insert of existing {} succeeded", key);
                    staged.insert(key, body);
                }
                Err(err) => {
                    assert_eq!(err.code(), 1210);
                    assert!(staged.contains_key(&key));
                }
            }
        }
        35..=59 => match handle.update(&key, Value::Object(body.clone())) {
            Ok(_) => {
                let doc = staged.get_mut(&key).expect("update of missing key succeeded");
                for (field, value) in body {
                    doc.insert(field, value);
                }
            }
            Err(err) => {
                assert_eq!(err.code(), 1202);
                assert!(!staged.contains_key(&key));
            }
        },
        60..=74 => match handle.replace(&key, Value::Object(body.clone())) {
            Ok(_) => {
                assert!(staged.insert(key, body).is_some());
            }
            Err(err) => {
                assert_eq!(err.code(), 1202);
                assert!(!staged.contains_key(&key));
            }
        },
        75..=97 => match handle.remove(&key) {
            Ok(_) => {
                assert!(staged.remove(&key).is_some());
            }
            Err(err) => {
                assert_eq!(err.code(), 1202);
                assert!(!staged.contains_key(&key));
            }
        },
        _ => {
            let removed = handle.truncate().unwrap();
            assert_eq!(removed, staged.len());
            staged.clear();
        }
    }
}

#[test]
fn test_engine_matches_truth_model() {
    let server = Server::default();
    let db = server.create_database("model").unwrap();
    let coll = db.create_collection("c").unwrap();

    for seed in 0..5u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut committed: Model = observed(coll.all().unwrap());

        for round in 0..40 {
            let trx = db.begin(TransactionOptions::new().write(["c"])).unwrap();
            let handle = trx.collection("c").unwrap();
            let mut staged = committed.clone();

            for _ in 0..rng.gen_range(1..30) {
                random_op(&mut rng, &handle, &mut staged);
            }
            assert_eq!(observed(handle.all().unwrap()), staged, "seed {} round {}", seed, round);
            assert_eq!(handle.count().unwrap(), staged.len());

            assert_eq!(observed(coll.all().unwrap()), committed, "uncommitted writes leaked");

            if rng.gen_bool(0.6) {
                trx.commit().unwrap();
                committed = staged;
            } else {
                trx.abort().unwrap();
            }

            assert_eq!(observed(coll.all().unwrap()), committed, "seed {} round {}", seed, round);
            assert_eq!(coll.count().unwrap(), committed.len());
        }
    }

    assert!(db.list_transactions().is_empty());
    db.garbage_collect().unwrap();
}
