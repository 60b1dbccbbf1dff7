use crate::core::constants::*;
use crate::core::document::{KeyGenerator, Revision};
use crate::core::errors::*;
use crate::core::index::{IndexDefinition, SecondaryIndex};
use crate::core::mvcc::{DocumentVersion, VersionChain};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// A buffered change waiting to be published by a commit.
#[derive(Debug, Clone)]
pub enum PendingWrite {
    Version { rev: Revision, data: Arc<Map<String, Value>> },
    Tombstone,
}

impl PendingWrite {
    pub fn payload(&self) -> Option<&Arc<Map<String, Value>>> {
        match self {
            PendingWrite::Version { data, .. } => Some(data),
            PendingWrite::Tombstone => None,
        }
    }

    pub fn rev(&self) -> Option<Revision> {
        match self {
            PendingWrite::Version { rev, .. } => Some(*rev),
            PendingWrite::Tombstone => None,
        }
    }
}

/// A committed document as read at some snapshot.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub key: String,
    pub rev: Revision,
    pub data: Arc<Map<String, Value>>,
}

struct StoreInner {
    chains: BTreeMap<String, VersionChain>,
    live_count: usize,
    /// Sequence of the last applied commit.
    last_seq: CommitSeq,
    indexes: Vec<SecondaryIndex>,
}

/// Committed multi-version state of one collection.
///
/// Only commits mutate it; every transaction reads it through its own
/// snapshot and layers its private buffer on top.
pub struct CollectionStore {
    name: String,
    inner: RwLock<StoreInner>,
    keys: KeyGenerator,
}

impl CollectionStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inner: RwLock::new(StoreInner {
                chains: BTreeMap::new(),
                live_count: 0,
                last_seq: 0,
                indexes: Vec::new(),
            }),
            keys: KeyGenerator::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generate_key(&self) -> Result<String> {
        self.keys.next().ok_or_else(|| Error::OutOfKeys {
            collection: self.name.clone(),
        })
    }

    pub fn observe_key(&self, key: &str) {
        self.keys.observe(key);
    }

    pub fn visible(&self, key: &str, snapshot: CommitSeq) -> Result<Option<StoredDocument>> {
        let inner = self.inner.read()
            .map_err(|_| Error::LockPoisoned { lock_name: format!("store.{}", self.name) })?;

        Ok(inner
            .chains
            .get(key)
            .and_then(|chain| chain.visible(snapshot))
            .map(|v| StoredDocument {
                key: key.to_string(),
                rev: v.rev,
                data: Arc::clone(&v.data),
            }))
    }

    /// Revision of the latest committed version, `None` when the key is
    /// absent or removed.
    pub fn latest_rev(&self, key: &str) -> Result<Option<Revision>> {
        let inner = self.inner.read()
            .map_err(|_| Error::LockPoisoned { lock_name: format!("store.{}", self.name) })?;

        Ok(inner.chains.get(key).and_then(|chain| chain.latest()).map(|v| v.rev))
    }

    /// Every document visible at `snapshot`, ordered by key.
    pub fn scan(&self, snapshot: CommitSeq) -> Result<Vec<StoredDocument>> {
        let inner = self.inner.read()
            .map_err(|_| Error::LockPoisoned { lock_name: format!("store.{}", self.name) })?;

        Ok(inner
            .chains
            .iter()
            .filter_map(|(key, chain)| {
                chain.visible(snapshot).map(|v| StoredDocument {
                    key: key.clone(),
                    rev: v.rev,
                    data: Arc::clone(&v.data),
                })
            })
            .collect())
    }

    pub fn count(&self, snapshot: CommitSeq) -> Result<usize> {
        let inner = self.inner.read()
            .map_err(|_| Error::LockPoisoned { lock_name: format!("store.{}", self.name) })?;
        if snapshot >= inner.last_seq {
            return Ok(inner.live_count);
        }

        Ok(inner
            .chains
            .values()
            .filter(|chain| chain.visible(snapshot).is_some())
            .count())
    }

    #[cfg(test)]
    pub(crate) fn live_count(&self) -> usize {
        self.inner.read().recover_poison().live_count
    }

    /// Looks for a committed document other than `own_key` that occupies
    /// the same unique index slot as `payload`. Documents for which
    /// `overridden` returns true are ignored, since the caller replaces or
    /// removes them.
    pub fn unique_violation(
        &self,
        payload: &Map<String, Value>,
        own_key: &str,
        overridden: impl Fn(&str) -> bool,
    ) -> Result<Option<Error>> {
        let inner = self.inner.read()
            .map_err(|_| Error::LockPoisoned { lock_name: format!("store.{}", self.name) })?;

        for index in inner.indexes.iter().filter(|i| i.definition.unique) {
            let Some(index_key) = index.index_key(payload) else {
                continue;
            };
            let taken = index
                .holders(&index_key)
                .any(|holder| holder != own_key && !overridden(holder));
            if taken {
                return Ok(Some(Error::UniqueConstraintViolation {
                    collection: self.name.clone(),
                    index: index.definition.name.clone(),
                    key: own_key.to_string(),
                }));
            }
        }
        Ok(None)
    }

    /// Unique slots `payload` would occupy, as (index name, slot) pairs.
    pub fn unique_slots(&self, payload: &Map<String, Value>) -> Vec<(String, String)> {
        let inner = self.inner.read().recover_poison();
        inner
            .indexes
            .iter()
            .filter(|i| i.definition.unique)
            .filter_map(|i| i.index_key(payload).map(|k| (i.definition.name.clone(), k)))
            .collect()
    }

    /// Publishes a transaction's buffered writes for this collection as
    /// commit `seq`.
    pub fn apply<'a>(
        &self,
        seq: CommitSeq,
        writes: impl IntoIterator<Item = (&'a String, &'a PendingWrite)>,
    ) -> Result<usize> {
        let mut inner = self.inner.write()
            .map_err(|_| Error::LockPoisoned { lock_name: format!("store.{}", self.name) })?;
        let inner = &mut *inner;

        let mut applied = 0;
        for (key, write) in writes {
            if matches!(write, PendingWrite::Tombstone) && !inner.chains.contains_key(key) {
                continue;
            }
            let chain = inner.chains.entry(key.clone()).or_default();

            if let Some(old) = chain.retire(seq) {
                for index in inner.indexes.iter_mut() {
                    index.remove(&old.data, key);
                }
                inner.live_count -= 1;
            }

            if let PendingWrite::Version { rev, data } = write {
                for index in inner.indexes.iter_mut() {
                    index.insert(data, key);
                }
                chain.push(DocumentVersion::new(*rev, seq, Arc::clone(data)));
                inner.live_count += 1;
            }
            applied += 1;
        }
        inner.last_seq = inner.last_seq.max(seq);

        debug!(collection = %self.name, seq, applied, "applied commit");
        Ok(applied)
    }

    pub fn garbage_collect(&self, oldest_active: CommitSeq) -> Result<usize> {
        let mut inner = self.inner.write()
            .map_err(|_| Error::LockPoisoned { lock_name: format!("store.{}", self.name) })?;

        let mut removed = 0;
        inner.chains.retain(|_, chain| {
            removed += chain.garbage_collect(oldest_active);
            !chain.is_empty()
        });
        Ok(removed)
    }

    /// Number of stored versions across all keys, live or not.
    #[cfg(test)]
    pub(crate) fn version_count(&self) -> usize {
        let inner = self.inner.read().recover_poison();
        inner.chains.values().map(VersionChain::len).sum()
    }

    /// Creates a secondary index over the latest committed state. Returns
    /// false when an identical index already exists.
    pub fn ensure_index(&self, definition: IndexDefinition) -> Result<bool> {
        definition.validate()?;

        let mut inner = self.inner.write()
            .map_err(|_| Error::LockPoisoned { lock_name: format!("store.{}", self.name) })?;

        if let Some(existing) = inner.indexes.iter().find(|i| i.definition.name == definition.name) {
            if existing.definition == definition {
                return Ok(false);
            }
            return Err(Error::DuplicateName { name: definition.name });
        }

        let mut index = SecondaryIndex::new(definition);
        for (key, chain) in &inner.chains {
            let Some(live) = chain.latest() else {
                continue;
            };
            if index.definition.unique {
                if let Some(slot) = index.index_key(&live.data) {
                    if index.holders(&slot).next().is_some() {
                        return Err(Error::UniqueConstraintViolation {
                            collection: self.name.clone(),
                            index: index.definition.name.clone(),
                            key: key.clone(),
                        });
                    }
                }
            }
            index.insert(&live.data, key);
        }

        debug!(collection = %self.name, index = %index.definition.name, entries = index.len(), "created index");
        inner.indexes.push(index);
        Ok(true)
    }

    pub fn indexes(&self) -> Vec<IndexDefinition> {
        let inner = self.inner.read().recover_poison();
        inner.indexes.iter().map(|i| i.definition.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::document::RevisionClock;
    use serde_json::json;

    fn version(clock: &RevisionClock, v: Value) -> PendingWrite {
        PendingWrite::Version {
            rev: clock.next().unwrap(),
            data: Arc::new(v.as_object().cloned().unwrap()),
        }
    }

    fn commit(store: &CollectionStore, seq: CommitSeq, writes: Vec<(&str, PendingWrite)>) {
        let writes: BTreeMap<String, PendingWrite> =
            writes.into_iter().map(|(k, w)| (k.to_string(), w)).collect();
        store.apply(seq, &writes).unwrap();
    }

    #[test]
    fn test_snapshot_reads_survive_later_commits() {
        let clock = RevisionClock::new();
        let store = CollectionStore::new("c");
        commit(&store, 1, vec![("a", version(&clock, json!({"v": 1})))]);
        commit(&store, 2, vec![("a", version(&clock, json!({"v": 2}))), ("b", version(&clock, json!({})))]);
        commit(&store, 3, vec![("a", PendingWrite::Tombstone)]);

        assert_eq!(store.visible("a", 1).unwrap().unwrap().data["v"], 1);
        assert_eq!(store.visible("a", 2).unwrap().unwrap().data["v"], 2);
        assert!(store.visible("a", 3).unwrap().is_none());
        assert!(store.latest_rev("a").unwrap().is_none());

        assert_eq!(store.count(1).unwrap(), 1);
        assert_eq!(store.count(2).unwrap(), 2);
        assert_eq!(store.count(3).unwrap(), 1);
        assert_eq!(store.live_count(), 1);
        assert_eq!(store.scan(2).unwrap().len(), 2);
    }

    #[test]
    fn test_garbage_collect_keeps_reachable_versions() {
        let clock = RevisionClock::new();
        let store = CollectionStore::new("c");
        commit(&store, 1, vec![("a", version(&clock, json!({"v": 1})))]);
        commit(&store, 2, vec![("a", version(&clock, json!({"v": 2})))]);
        commit(&store, 3, vec![("a", PendingWrite::Tombstone)]);
        assert_eq!(store.version_count(), 2);

        assert_eq!(store.garbage_collect(1).unwrap(), 0);
        assert_eq!(store.garbage_collect(2).unwrap(), 1);
        assert_eq!(store.visible("a", 2).unwrap().unwrap().data["v"], 2);
        assert_eq!(store.garbage_collect(3).unwrap(), 1);
        assert_eq!(store.version_count(), 0);
    }

    #[test]
    fn test_unique_index_tracks_commits() {
        let clock = RevisionClock::new();
        let store = CollectionStore::new("users");
        assert!(store.ensure_index(IndexDefinition::new("email", &["email"]).unique()).unwrap());
        assert!(!store.ensure_index(IndexDefinition::new("email", &["email"]).unique()).unwrap());
        assert!(matches!(
            store.ensure_index(IndexDefinition::new("email", &["other"])),
            Err(Error::DuplicateName { .. })
        ));

        commit(&store, 1, vec![("u1", version(&clock, json!({"email": "a@x"})))]);

        let payload = json!({"email": "a@x"});
        let payload = payload.as_object().unwrap();
        assert!(store.unique_violation(payload, "u2", |_| false).unwrap().is_some());
        assert!(store.unique_violation(payload, "u1", |_| false).unwrap().is_none());
        assert!(store.unique_violation(payload, "u2", |k| k == "u1").unwrap().is_none());

        commit(&store, 2, vec![("u1", version(&clock, json!({"email": "b@x"})))]);
        assert!(store.unique_violation(payload, "u2", |_| false).unwrap().is_none());
    }

    #[test]
    fn test_unique_index_creation_rejects_duplicates() {
        let clock = RevisionClock::new();
        let store = CollectionStore::new("c");
        commit(&store, 1, vec![
            ("a", version(&clock, json!({"n": 1}))),
            ("b", version(&clock, json!({"n": 1}))),
        ]);

        assert!(matches!(
            store.ensure_index(IndexDefinition::new("n", &["n"]).unique()),
            Err(Error::UniqueConstraintViolation { .. })
        ));
        assert!(store.ensure_index(IndexDefinition::new("n", &["n"])).unwrap());
        assert_eq!(store.indexes().len(), 1);
    }
}
