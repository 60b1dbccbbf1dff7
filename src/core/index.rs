use crate::core::errors::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Total order over JSON values: null < bool < number < string < array < object.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    use Value::*;

    match (a, b) {
        (Null, Null) => Ordering::Equal,
        (Null, _) => Ordering::Less,
        (_, Null) => Ordering::Greater,

        (Bool(a_val), Bool(b_val)) => a_val.cmp(b_val),
        (Bool(_), _) => Ordering::Less,
        (_, Bool(_)) => Ordering::Greater,

        (Number(a_num), Number(b_num)) => {
            let a_f64 = a_num.as_f64().unwrap_or(0.0);
            let b_f64 = b_num.as_f64().unwrap_or(0.0);
            a_f64.partial_cmp(&b_f64).unwrap_or(Ordering::Equal)
        }
        (Number(_), _) => Ordering::Less,
        (_, Number(_)) => Ordering::Greater,

        (String(a_str), String(b_str)) => a_str.cmp(b_str),
        (String(_), _) => Ordering::Less,
        (_, String(_)) => Ordering::Greater,

        (Array(a_arr), Array(b_arr)) => {
            for (a_elem, b_elem) in a_arr.iter().zip(b_arr.iter()) {
                match compare_values(a_elem, b_elem) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            a_arr.len().cmp(&b_arr.len())
        }
        (Array(_), _) => Ordering::Less,
        (_, Array(_)) => Ordering::Greater,

        (Object(a_obj), Object(b_obj)) => {
            let mut a_keys: Vec<_> = a_obj.keys().collect();
            let mut b_keys: Vec<_> = b_obj.keys().collect();
            a_keys.sort();
            b_keys.sort();

            for (a_key, b_key) in a_keys.iter().zip(b_keys.iter()) {
                match a_key.cmp(b_key) {
                    Ordering::Equal => match compare_values(&a_obj[*a_key], &b_obj[*b_key]) {
                        Ordering::Equal => continue,
                        other => return other,
                    },
                    other => return other,
                }
            }
            a_keys.len().cmp(&b_keys.len())
        }
    }
}

/// Reads a possibly nested attribute (`a.b.c`), yielding null when absent.
pub fn extract_field_value(doc: &Map<String, Value>, field: &str) -> Value {
    let mut parts = field.split('.');
    let mut current = match parts.next().and_then(|first| doc.get(first)) {
        Some(value) => value,
        None => return Value::Null,
    };

    for part in parts {
        match current.get(part) {
            Some(value) => current = value,
            None => return Value::Null,
        }
    }

    current.clone()
}

pub fn extract_field_values(doc: &Map<String, Value>, fields: &[String]) -> Vec<Value> {
    fields.iter().map(|field| extract_field_value(doc, field)).collect()
}

/// Secondary index description, as passed to `Collection::ensure_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub sparse: bool,
}

impl IndexDefinition {
    pub fn new(name: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            name: name.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            unique: false,
            sparse: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn sparse(mut self) -> Self {
        self.sparse = true;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::bad_parameter("index name must not be empty"));
        }
        if self.fields.is_empty() {
            return Err(Error::bad_parameter(format!("index '{}' needs at least one field", self.name)));
        }
        if self.fields.iter().any(|f| f.is_empty() || f.starts_with('_')) {
            return Err(Error::bad_parameter(format!(
                "index '{}' fields must be non-empty and must not name system attributes",
                self.name
            )));
        }
        Ok(())
    }
}

/// Index over the latest committed state of one collection.
///
/// Entries are keyed by the JSON rendering of the indexed field values, so
/// equal values always land in the same bucket regardless of map order.
#[derive(Debug, Clone)]
pub struct SecondaryIndex {
    pub definition: IndexDefinition,
    entries: BTreeMap<String, BTreeSet<String>>,
}

impl SecondaryIndex {
    pub fn new(definition: IndexDefinition) -> Self {
        Self {
            definition,
            entries: BTreeMap::new(),
        }
    }

    /// Bucket key for a payload; `None` when a sparse index skips it.
    pub fn index_key(&self, payload: &Map<String, Value>) -> Option<String> {
        let values = extract_field_values(payload, &self.definition.fields);
        if self.definition.sparse && values.iter().any(Value::is_null) {
            return None;
        }
        serde_json::to_string(&values).ok()
    }

    pub fn insert(&mut self, payload: &Map<String, Value>, doc_key: &str) {
        if let Some(index_key) = self.index_key(payload) {
            self.entries.entry(index_key).or_default().insert(doc_key.to_string());
        }
    }

    pub fn remove(&mut self, payload: &Map<String, Value>, doc_key: &str) {
        if let Some(index_key) = self.index_key(payload) {
            if let Some(holders) = self.entries.get_mut(&index_key) {
                holders.remove(doc_key);
                if holders.is_empty() {
                    self.entries.remove(&index_key);
                }
            }
        }
    }

    pub fn holders(&self, index_key: &str) -> impl Iterator<Item = &String> {
        self.entries.get(index_key).into_iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_type_ordering() {
        let ordered = vec![
            json!(null),
            json!(false),
            json!(true),
            json!(-1.5),
            json!(3),
            json!("a"),
            json!("b"),
            json!([1]),
            json!([1, 2]),
            json!({"a": 1}),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(compare_values(&pair[0], &pair[1]), Ordering::Less, "{:?}", pair);
        }
        assert_eq!(compare_values(&json!(2), &json!(2.0)), Ordering::Equal);
    }

    #[test]
    fn test_extract_nested_field() {
        let doc = obj(json!({"a": {"b": {"c": 7}}, "x": 1}));
        assert_eq!(extract_field_value(&doc, "a.b.c"), json!(7));
        assert_eq!(extract_field_value(&doc, "a.missing"), Value::Null);
        assert_eq!(extract_field_value(&doc, "x.y"), Value::Null);
    }

    #[test]
    fn test_sparse_index_skips_nulls() {
        let mut index = SecondaryIndex::new(IndexDefinition::new("email", &["email"]).sparse());
        index.insert(&obj(json!({"name": "no email"})), "k1");
        index.insert(&obj(json!({"email": "a@b"})), "k2");
        assert_eq!(index.len(), 1);

        let key = index.index_key(&obj(json!({"email": "a@b"}))).unwrap();
        assert_eq!(index.holders(&key).collect::<Vec<_>>(), vec!["k2"]);

        index.remove(&obj(json!({"email": "a@b"})), "k2");
        assert!(index.is_empty());
    }

    #[test]
    fn test_compound_index_buckets() {
        let mut index = SecondaryIndex::new(IndexDefinition::new("ab", &["a", "b"]));
        index.insert(&obj(json!({"a": 1, "b": 2})), "k1");
        index.insert(&obj(json!({"b": 2, "a": 1})), "k2");
        index.insert(&obj(json!({"a": 1})), "k3");

        let key = index.index_key(&obj(json!({"a": 1, "b": 2}))).unwrap();
        assert_eq!(index.holders(&key).count(), 2);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_definition_validation() {
        assert!(IndexDefinition::new("ok", &["a"]).validate().is_ok());
        assert!(IndexDefinition::new("", &["a"]).validate().is_err());
        assert!(IndexDefinition::new("none", &[]).validate().is_err());
        assert!(IndexDefinition::new("sys", &["_key"]).validate().is_err());
    }
}
