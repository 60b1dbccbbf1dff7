use crate::core::database::Database;
use crate::core::document::DocumentMeta;
use crate::core::errors::*;
use crate::core::index::IndexDefinition;
use crate::core::options::{TransactionOptions, WriteOptions};
use crate::core::tx_collection::DocumentOps;
use serde_json::Value;
use tracing::debug;

/// Collection handle outside any user transaction. Every call runs in its
/// own short transaction that commits on success.
#[derive(Clone)]
pub struct Collection {
    db: Database,
    name: String,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("database", &self.db.name())
            .field("name", &self.name)
            .finish()
    }
}

impl Collection {
    pub(crate) fn new(db: Database, name: &str) -> Self {
        Self {
            db,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn run<T>(&self, write: bool, f: impl FnOnce(&mut DocumentOps<'_>) -> Result<T>) -> Result<T> {
        let options = if write {
            TransactionOptions::new().write([self.name.as_str()])
        } else {
            TransactionOptions::new().read([self.name.as_str()])
        };
        let trx = self.db.begin_internal(options, false)?;

        match trx.with_ops(f) {
            Ok(result) => match trx.commit() {
                Ok(_) => Ok(result),
                Err(err) => {
                    let _ = trx.abort();
                    Err(err)
                }
            },
            Err(err) => {
                let _ = trx.abort();
                Err(err)
            }
        }
    }

    pub fn insert(&self, doc: Value) -> Result<DocumentMeta> {
        self.insert_with(doc, &WriteOptions::default())
    }

    pub fn insert_with(&self, doc: Value, options: &WriteOptions) -> Result<DocumentMeta> {
        self.run(true, |ops| ops.insert_document(&self.name, &doc, options))
            .map(|w| w.meta)
    }

    pub fn document(&self, key: &str) -> Result<Value> {
        let selector = Value::String(key.to_string());
        self.run(false, |ops| ops.read_document(&self.name, &selector))
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        self.run(false, |ops| ops.exists(&self.name, key))
    }

    pub fn update(&self, key: &str, patch: Value) -> Result<DocumentMeta> {
        self.update_with(key, patch, &WriteOptions::default())
    }

    pub fn update_with(&self, key: &str, patch: Value, options: &WriteOptions) -> Result<DocumentMeta> {
        let selector = Value::String(key.to_string());
        self.run(true, |ops| ops.update_document(&self.name, &selector, &patch, options))
            .map(|w| w.meta)
    }

    pub fn replace(&self, key: &str, doc: Value) -> Result<DocumentMeta> {
        self.replace_with(key, doc, &WriteOptions::default())
    }

    pub fn replace_with(&self, key: &str, doc: Value, options: &WriteOptions) -> Result<DocumentMeta> {
        let selector = Value::String(key.to_string());
        self.run(true, |ops| ops.replace_document(&self.name, &selector, &doc, options))
            .map(|w| w.meta)
    }

    pub fn remove(&self, key: &str) -> Result<DocumentMeta> {
        self.remove_with(key, &WriteOptions::default())
    }

    pub fn remove_with(&self, key: &str, options: &WriteOptions) -> Result<DocumentMeta> {
        let selector = Value::String(key.to_string());
        self.run(true, |ops| ops.remove_document(&self.name, &selector, options))
            .map(|w| w.meta)
    }

    /// Committed document count.
    pub fn count(&self) -> Result<usize> {
        self.run(false, |ops| ops.count(&self.name))
    }

    pub fn all(&self) -> Result<Vec<Value>> {
        self.run(false, |ops| ops.all(&self.name))
    }

    pub fn by_example(&self, example: Value) -> Result<Vec<Value>> {
        self.run(false, |ops| ops.by_example(&self.name, &example, None))
    }

    pub fn truncate(&self) -> Result<usize> {
        self.run(true, |ops| ops.truncate(&self.name))
    }

    /// Adds a secondary index. Returns false if an identical one exists.
    /// Refused with `Locked` while transactions hold intents on the
    /// collection.
    pub fn ensure_index(&self, definition: IndexDefinition) -> Result<bool> {
        if self.db.locks.holder_count(&self.name) > 0 {
            return Err(Error::Locked {
                reason: format!("collection '{}' is in use by a transaction", self.name),
            });
        }

        let name = definition.name.clone();
        let created = self.db.store(&self.name)?.ensure_index(definition)?;
        if created {
            debug!(collection = %self.name, index = %name, "created index");
        }
        Ok(created)
    }

    pub fn indexes(&self) -> Result<Vec<IndexDefinition>> {
        Ok(self.db.store(&self.name)?.indexes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::options::ServerOptions;
    use crate::core::server::Server;
    use serde_json::json;

    fn setup() -> Collection {
        let server = Server::new(ServerOptions::default()).unwrap();
        let db = server.create_database("test").unwrap();
        db.create_collection("items").unwrap()
    }

    #[test]
    fn test_single_operations_commit() {
        let items = setup();
        let meta = items.insert(json!({"_key": "a", "v": 1})).unwrap();
        let updated = items.update("a", json!({"v": 2})).unwrap();
        assert_ne!(meta.rev, updated.rev);
        assert_eq!(updated.old_rev, Some(meta.rev));

        assert_eq!(items.document("a").unwrap()["v"], 2);
        assert_eq!(items.count().unwrap(), 1);
        assert!(items.db.list_transactions().is_empty());
    }

    #[test]
    fn test_failed_operation_leaves_nothing_behind() {
        let items = setup();
        assert_eq!(items.update("missing", json!({})).unwrap_err().code(), 1202);
        assert_eq!(items.db.locks.holder_count("items"), 0);
        assert_eq!(items.db.detector.claim_count(), 0);
        assert_eq!(items.db.metrics().transactions_aborted, 1);
    }

    #[test]
    fn test_unique_index() {
        let items = setup();
        items.insert(json!({"_key": "a", "email": "x@y"})).unwrap();

        assert!(items.ensure_index(IndexDefinition::new("email", &["email"]).unique()).unwrap());
        assert!(!items.ensure_index(IndexDefinition::new("email", &["email"]).unique()).unwrap());
        assert_eq!(items.indexes().unwrap().len(), 1);

        let err = items.insert(json!({"_key": "b", "email": "x@y"})).unwrap_err();
        assert_eq!(err.code(), 1210);
        assert_eq!(items.count().unwrap(), 1);
    }

    #[test]
    fn test_index_creation_blocked_by_transaction() {
        let items = setup();
        let trx = items.db.begin(TransactionOptions::new().read(["items"])).unwrap();
        let err = items.ensure_index(IndexDefinition::new("v", &["v"])).unwrap_err();
        assert_eq!(err.code(), 28);
        trx.abort().unwrap();
        assert!(items.ensure_index(IndexDefinition::new("v", &["v"])).unwrap());
    }

    #[test]
    fn test_truncate_and_by_example() {
        let items = setup();
        for i in 0..4 {
            items.insert(json!({"_key": format!("k{}", i), "even": i % 2 == 0})).unwrap();
        }
        assert_eq!(items.by_example(json!({"even": true})).unwrap().len(), 2);
        assert_eq!(items.truncate().unwrap(), 4);
        assert!(items.all().unwrap().is_empty());
    }
}
