use crate::core::conflict::conflict_error;
use crate::core::constants::*;
use crate::core::database::Database;
use crate::core::document::*;
use crate::core::errors::*;
use crate::core::index::{compare_values, extract_field_value};
use crate::core::options::{AccessMode, WriteOptions};
use crate::core::query::exec::{DocumentSource, WriteResult};
use crate::core::store::{CollectionStore, PendingWrite};
use crate::core::transaction::{Transaction, TrxInner, TrxState};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

type Visible = (Revision, Arc<Map<String, Value>>);

/// Outcome of one document write.
#[derive(Debug, Clone)]
pub(crate) struct Written {
    pub meta: DocumentMeta,
    pub new: Option<Value>,
    pub old: Option<Value>,
}

/// Document operations of one transaction, run while its state lock is
/// held. Handles, cursors and the outer collection API all go through here.
pub(crate) struct DocumentOps<'a> {
    db: &'a Database,
    state: &'a TrxState,
    inner: &'a mut TrxInner,
}

impl<'a> DocumentOps<'a> {
    pub(crate) fn new(db: &'a Database, state: &'a TrxState, inner: &'a mut TrxInner) -> Self {
        Self { db, state, inner }
    }

    /// The key as this transaction sees it: its own buffer first, then the
    /// committed version visible at its snapshot.
    fn view(&self, store: &CollectionStore, key: &str) -> Result<Option<Visible>> {
        if let Some(write) = self.inner.buffer.get(store.name(), key) {
            return Ok(match &write.pending {
                PendingWrite::Version { rev, data } => Some((*rev, Arc::clone(data))),
                PendingWrite::Tombstone => None,
            });
        }
        Ok(store
            .visible(key, self.state.snapshot)?
            .map(|doc| (doc.rev, doc.data)))
    }

    fn merged_view(&self, store: &CollectionStore) -> Result<BTreeMap<String, Visible>> {
        let mut docs: BTreeMap<String, Visible> = store
            .scan(self.state.snapshot)?
            .into_iter()
            .map(|doc| (doc.key, (doc.rev, doc.data)))
            .collect();

        if let Some(writes) = self.inner.buffer.collection(store.name()) {
            for (key, write) in writes {
                match &write.pending {
                    PendingWrite::Version { rev, data } => {
                        docs.insert(key.clone(), (*rev, Arc::clone(data)));
                    }
                    PendingWrite::Tombstone => {
                        docs.remove(key);
                    }
                }
            }
        }
        Ok(docs)
    }

    fn require_write(&self, collection: &str) -> Result<()> {
        match self.inner.intents.get(collection) {
            Some(mode) if mode.can_write() => Ok(()),
            _ => Err(Error::UnregisteredCollection {
                collection: collection.to_string(),
                access: AccessMode::Write.as_str().to_string(),
            }),
        }
    }

    fn check_limit(&self) -> Result<()> {
        let max = self.db.shared.options.max_transaction_operations;
        if max > 0 && self.inner.operations >= max {
            return Err(Error::TransactionInternal {
                reason: format!("transaction {} exceeded {} write operations", self.state.id, max),
            });
        }
        Ok(())
    }

    /// Claims the key for this transaction on its first write. Fails when
    /// another running transaction holds the key, or when a commit after
    /// our snapshot changed it.
    fn claim(&mut self, store: &CollectionStore, key: &str) -> Result<bool> {
        let collection = store.name();
        if self.inner.buffer.contains(collection, key) {
            return Ok(false);
        }

        let newly = self.db.detector.claim(self.state.id, collection, key).map_err(|err| {
            self.db.metrics.transaction_conflict();
            err
        })?;
        if !newly {
            return Ok(false);
        }

        let seen = store.visible(key, self.state.snapshot)?.map(|doc| doc.rev);
        let latest = store.latest_rev(key)?;
        if seen != latest {
            let slot = (collection.to_string(), key.to_string());
            self.db.detector.release_all(self.state.id, std::iter::once(&slot));
            self.db.metrics.transaction_conflict();
            return Err(conflict_error(collection, key, seen, latest));
        }

        self.inner.claims.push((collection.to_string(), key.to_string()));
        Ok(true)
    }

    fn release(&mut self, collection: &str, key: &str) {
        let slot = (collection.to_string(), key.to_string());
        self.db.detector.release_all(self.state.id, std::iter::once(&slot));
        self.inner.claims.retain(|claimed| claimed != &slot);
    }

    /// Unique index check against this transaction's view: committed
    /// holders not overridden by our buffer, then our own buffered versions.
    fn check_unique(&self, store: &CollectionStore, key: &str, payload: &Map<String, Value>) -> Result<()> {
        let buffered = self.inner.buffer.collection(store.name());
        let overridden = |holder: &str| buffered.map(|writes| writes.contains_key(holder)).unwrap_or(false);

        let violation = match store.unique_violation(payload, key, overridden)? {
            Some(err) => Some(err),
            None => {
                let slots = store.unique_slots(payload);
                let clash = if slots.is_empty() {
                    None
                } else {
                    buffered.and_then(|writes| {
                        writes.iter().find_map(|(other, write)| {
                            let data = write.pending.payload()?;
                            if other == key {
                                return None;
                            }
                            store
                                .unique_slots(data)
                                .into_iter()
                                .find(|slot| slots.contains(slot))
                        })
                    })
                };
                clash.map(|(index, _)| Error::UniqueConstraintViolation {
                    collection: store.name().to_string(),
                    index,
                    key: key.to_string(),
                })
            }
        };

        match violation {
            Some(err) => {
                self.db.metrics.unique_violation();
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn buffer_write(
        &mut self,
        store: &CollectionStore,
        key: &str,
        expected: Option<Revision>,
        pending: PendingWrite,
    ) -> Result<()> {
        self.check_limit()?;
        let newly = self.claim(store, key)?;

        if let Some(payload) = pending.payload() {
            if let Err(err) = self.check_unique(store, key, payload) {
                if newly {
                    self.release(store.name(), key);
                }
                return Err(err);
            }
        }

        self.inner.buffer.record(store.name(), key, expected, pending);
        self.inner.operations += 1;
        Ok(())
    }

    fn check_expected(
        &self,
        collection: &str,
        key: &str,
        current: Revision,
        options: &WriteOptions,
        selector: &Value,
        body_rev: Option<Revision>,
    ) -> Result<()> {
        let wanted = match options.if_match {
            Some(rev) => Some(rev),
            None if !options.ignore_revs => match selector.get(REV_ATTRIBUTE) {
                Some(Value::String(rev)) => Some(rev.parse()?),
                _ => body_rev,
            },
            None => None,
        };

        match wanted {
            Some(rev) if rev != current => {
                self.db.metrics.transaction_conflict();
                Err(conflict_error(collection, key, Some(rev), Some(current)))
            }
            _ => Ok(()),
        }
    }

    fn not_found(collection: &str, key: &str) -> Error {
        Error::DocumentNotFound {
            collection: collection.to_string(),
            key: key.to_string(),
        }
    }

    pub(crate) fn read_document(&mut self, collection: &str, selector: &Value) -> Result<Value> {
        let store = self.db.store(collection)?;
        let key = selector_key(collection, selector)?;
        let (rev, data) = self
            .view(&store, &key)?
            .ok_or_else(|| Self::not_found(collection, &key))?;

        self.db.metrics.document_read();
        Ok(materialize(collection, &key, rev, &data))
    }

    pub(crate) fn exists(&mut self, collection: &str, key: &str) -> Result<bool> {
        let store = self.db.store(collection)?;
        Ok(self.view(&store, key)?.is_some())
    }

    pub(crate) fn count(&mut self, collection: &str) -> Result<usize> {
        let store = self.db.store(collection)?;
        let base = store.count(self.state.snapshot)? as isize;
        Ok((base + self.inner.buffer.count_delta(collection)).max(0) as usize)
    }

    pub(crate) fn all(&mut self, collection: &str) -> Result<Vec<Value>> {
        let store = self.db.store(collection)?;
        Ok(self
            .merged_view(&store)?
            .iter()
            .map(|(key, (rev, data))| materialize(collection, key, *rev, data))
            .collect())
    }

    /// Documents whose attributes equal every attribute of `example`.
    /// Dotted names reach into nested objects.
    pub(crate) fn by_example(&mut self, collection: &str, example: &Value, limit: Option<usize>) -> Result<Vec<Value>> {
        let example = example
            .as_object()
            .ok_or_else(|| Error::bad_parameter("example must be an object"))?;

        let mut found = Vec::new();
        for doc in self.all(collection)? {
            if limit.map(|l| found.len() >= l).unwrap_or(false) {
                break;
            }
            let Some(obj) = doc.as_object() else {
                continue;
            };
            let matches = example
                .iter()
                .all(|(field, want)| compare_values(&extract_field_value(obj, field), want) == Ordering::Equal);
            if matches {
                found.push(doc);
            }
        }
        Ok(found)
    }

    pub(crate) fn insert_document(&mut self, collection: &str, doc: &Value, options: &WriteOptions) -> Result<Written> {
        self.require_write(collection)?;
        let store = self.db.store(collection)?;
        let split = split_document(collection, doc)?;

        let key = match &split.key {
            Some(key) => {
                store.observe_key(key);
                key.clone()
            }
            None => store.generate_key()?,
        };

        let existing = self.view(&store, &key)?;
        let restore = if options.is_restore { split.rev } else { None };
        let taken = match &existing {
            Some(_) => restore.is_none(),
            None => !self.inner.buffer.contains(collection, &key) && store.latest_rev(&key)?.is_some(),
        };
        if taken {
            self.db.metrics.unique_violation();
            return Err(Error::UniqueConstraintViolation {
                collection: collection.to_string(),
                index: "primary".to_string(),
                key,
            });
        }

        let rev = match restore {
            Some(rev) => {
                self.db.shared.revisions.observe(rev);
                rev
            }
            None => self.db.shared.revisions.next()?,
        };
        let data = Arc::new(split.payload);
        let old_rev = existing.as_ref().map(|(rev, _)| *rev);

        self.buffer_write(&store, &key, old_rev, PendingWrite::Version { rev, data: Arc::clone(&data) })?;
        self.db.metrics.document_inserted();

        Ok(Written {
            meta: DocumentMeta::new(collection, &key, rev, old_rev),
            new: Some(materialize(collection, &key, rev, &data)),
            old: existing.map(|(rev, data)| materialize(collection, &key, rev, &data)),
        })
    }

    pub(crate) fn update_document(&mut self, collection: &str, selector: &Value, patch: &Value, options: &WriteOptions) -> Result<Written> {
        self.modify(collection, selector, patch, options, true)
    }

    pub(crate) fn replace_document(&mut self, collection: &str, selector: &Value, doc: &Value, options: &WriteOptions) -> Result<Written> {
        self.modify(collection, selector, doc, options, false)
    }

    fn modify(&mut self, collection: &str, selector: &Value, body: &Value, options: &WriteOptions, merge: bool) -> Result<Written> {
        self.require_write(collection)?;
        let store = self.db.store(collection)?;
        let key = selector_key(collection, selector)?;
        let split = split_document(collection, body)?;

        let (current_rev, current) = self
            .view(&store, &key)?
            .ok_or_else(|| Self::not_found(collection, &key))?;

        // A restored `_rev` is the revision to keep, not an expected one.
        let restore = if options.is_restore { split.rev } else { None };
        let body_rev = if restore.is_some() { None } else { split.rev };
        self.check_expected(collection, &key, current_rev, options, selector, body_rev)?;

        let payload = if merge {
            apply_patch(&current, &split.payload, options.keep_null, options.merge_objects)
        } else {
            split.payload
        };
        let rev = match restore {
            Some(rev) => {
                self.db.shared.revisions.observe(rev);
                rev
            }
            None => self.db.shared.revisions.next()?,
        };
        let data = Arc::new(payload);

        self.buffer_write(&store, &key, Some(current_rev), PendingWrite::Version { rev, data: Arc::clone(&data) })?;
        if merge {
            self.db.metrics.document_updated();
        } else {
            self.db.metrics.document_replaced();
        }

        Ok(Written {
            meta: DocumentMeta::new(collection, &key, rev, Some(current_rev)),
            new: Some(materialize(collection, &key, rev, &data)),
            old: Some(materialize(collection, &key, current_rev, &current)),
        })
    }

    pub(crate) fn remove_document(&mut self, collection: &str, selector: &Value, options: &WriteOptions) -> Result<Written> {
        self.require_write(collection)?;
        let store = self.db.store(collection)?;
        let key = selector_key(collection, selector)?;

        let (current_rev, current) = self
            .view(&store, &key)?
            .ok_or_else(|| Self::not_found(collection, &key))?;
        self.check_expected(collection, &key, current_rev, options, selector, None)?;

        self.buffer_write(&store, &key, Some(current_rev), PendingWrite::Tombstone)?;
        self.db.metrics.document_removed();

        Ok(Written {
            meta: DocumentMeta::new(collection, &key, current_rev, None),
            new: None,
            old: Some(materialize(collection, &key, current_rev, &current)),
        })
    }

    /// Buffers a removal of every document currently visible. Returns the
    /// number of documents removed.
    pub(crate) fn truncate(&mut self, collection: &str) -> Result<usize> {
        self.require_write(collection)?;
        let store = self.db.store(collection)?;
        let keys: Vec<String> = self.merged_view(&store)?.into_keys().collect();

        let options = WriteOptions::default();
        for key in &keys {
            self.remove_document(collection, &Value::String(key.clone()), &options)?;
        }
        Ok(keys.len())
    }
}

impl Written {
    fn into_result(self) -> WriteResult {
        WriteResult {
            new: self.new,
            old: self.old,
        }
    }
}

impl DocumentSource for DocumentOps<'_> {
    fn scan(&mut self, collection: &str) -> Result<Vec<Value>> {
        self.all(collection)
    }

    fn insert(&mut self, collection: &str, doc: &Value, options: &WriteOptions) -> Result<WriteResult> {
        self.insert_document(collection, doc, options).map(Written::into_result)
    }

    fn update(&mut self, collection: &str, selector: &Value, patch: &Value, options: &WriteOptions) -> Result<WriteResult> {
        self.update_document(collection, selector, patch, options).map(Written::into_result)
    }

    fn replace(&mut self, collection: &str, selector: &Value, doc: &Value, options: &WriteOptions) -> Result<WriteResult> {
        self.replace_document(collection, selector, doc, options).map(Written::into_result)
    }

    fn remove(&mut self, collection: &str, selector: &Value, options: &WriteOptions) -> Result<WriteResult> {
        self.remove_document(collection, selector, options).map(Written::into_result)
    }
}

/// Transaction-scoped access to one collection.
///
/// Reads see the transaction's own writes on top of its snapshot; writes
/// stay private to the transaction until it commits.
#[derive(Debug)]
pub struct TxCollection<'tx> {
    trx: &'tx Transaction,
    name: String,
}

impl<'tx> TxCollection<'tx> {
    pub(crate) fn new(trx: &'tx Transaction, name: &str) -> Self {
        Self {
            trx,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn insert(&self, doc: Value) -> Result<DocumentMeta> {
        self.insert_with(doc, &WriteOptions::default())
    }

    pub fn insert_with(&self, doc: Value, options: &WriteOptions) -> Result<DocumentMeta> {
        self.trx
            .with_ops(|ops| ops.insert_document(&self.name, &doc, options))
            .map(|w| w.meta)
    }

    pub fn document(&self, key: &str) -> Result<Value> {
        let selector = Value::String(key.to_string());
        self.trx.with_ops(|ops| ops.read_document(&self.name, &selector))
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        self.trx.with_ops(|ops| ops.exists(&self.name, key))
    }

    pub fn update(&self, key: &str, patch: Value) -> Result<DocumentMeta> {
        self.update_with(key, patch, &WriteOptions::default())
    }

    pub fn update_with(&self, key: &str, patch: Value, options: &WriteOptions) -> Result<DocumentMeta> {
        let selector = Value::String(key.to_string());
        self.trx
            .with_ops(|ops| ops.update_document(&self.name, &selector, &patch, options))
            .map(|w| w.meta)
    }

    pub fn replace(&self, key: &str, doc: Value) -> Result<DocumentMeta> {
        self.replace_with(key, doc, &WriteOptions::default())
    }

    pub fn replace_with(&self, key: &str, doc: Value, options: &WriteOptions) -> Result<DocumentMeta> {
        let selector = Value::String(key.to_string());
        self.trx
            .with_ops(|ops| ops.replace_document(&self.name, &selector, &doc, options))
            .map(|w| w.meta)
    }

    pub fn remove(&self, key: &str) -> Result<DocumentMeta> {
        self.remove_with(key, &WriteOptions::default())
    }

    pub fn remove_with(&self, key: &str, options: &WriteOptions) -> Result<DocumentMeta> {
        let selector = Value::String(key.to_string());
        self.trx
            .with_ops(|ops| ops.remove_document(&self.name, &selector, options))
            .map(|w| w.meta)
    }

    pub fn count(&self) -> Result<usize> {
        self.trx.with_ops(|ops| ops.count(&self.name))
    }

    /// Every document in the transaction's view, ordered by key.
    pub fn all(&self) -> Result<Vec<Value>> {
        self.trx.with_ops(|ops| ops.all(&self.name))
    }

    pub fn by_example(&self, example: Value) -> Result<Vec<Value>> {
        self.trx.with_ops(|ops| ops.by_example(&self.name, &example, None))
    }

    pub fn first_example(&self, example: Value) -> Result<Option<Value>> {
        self.trx
            .with_ops(|ops| ops.by_example(&self.name, &example, Some(1)))
            .map(|mut found| found.pop())
    }

    pub fn truncate(&self) -> Result<usize> {
        self.trx.with_ops(|ops| ops.truncate(&self.name))
    }
}
