use crate::core::document::Revision;
use crate::core::store::PendingWrite;
use std::collections::BTreeMap;

/// Latest buffered change of one key together with the revision the key
/// had in the transaction's snapshot when it was first written.
#[derive(Debug, Clone)]
pub struct BufferedWrite {
    pub expected: Option<Revision>,
    pub pending: PendingWrite,
}

/// Private writes of one transaction, keyed by collection then document key.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    collections: BTreeMap<String, BTreeMap<String, BufferedWrite>>,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, collection: &str, key: &str) -> Option<&BufferedWrite> {
        self.collections.get(collection)?.get(key)
    }

    pub fn contains(&self, collection: &str, key: &str) -> bool {
        self.get(collection, key).is_some()
    }

    /// Buffers `pending` for the key. The expected revision of the first
    /// write to a key is kept; later writes only replace the pending change.
    pub fn record(&mut self, collection: &str, key: &str, expected: Option<Revision>, pending: PendingWrite) {
        let writes = self.collections.entry(collection.to_string()).or_default();
        match writes.get_mut(key) {
            Some(existing) => existing.pending = pending,
            None => {
                writes.insert(key.to_string(), BufferedWrite { expected, pending });
            }
        }
    }

    pub fn collection(&self, collection: &str) -> Option<&BTreeMap<String, BufferedWrite>> {
        self.collections.get(collection)
    }

    pub fn collections(&self) -> impl Iterator<Item = (&String, &BTreeMap<String, BufferedWrite>)> {
        self.collections.iter()
    }

    /// Change in live document count of `collection` relative to the snapshot.
    pub fn count_delta(&self, collection: &str) -> isize {
        self.collections
            .get(collection)
            .map(|writes| {
                writes
                    .values()
                    .map(|w| {
                        let before = isize::from(w.expected.is_some());
                        let after = isize::from(w.pending.payload().is_some());
                        after - before
                    })
                    .sum()
            })
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.collections.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.values().all(BTreeMap::is_empty)
    }

    pub fn clear(&mut self) {
        self.collections.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::sync::Arc;

    fn version(raw: u64) -> PendingWrite {
        PendingWrite::Version {
            rev: Revision::from_raw(raw),
            data: Arc::new(Map::new()),
        }
    }

    #[test]
    fn test_first_expected_revision_is_kept() {
        let mut buffer = WriteBuffer::new();
        buffer.record("c", "k", Some(Revision::from_raw(1)), version(2));
        buffer.record("c", "k", Some(Revision::from_raw(2)), version(3));

        let write = buffer.get("c", "k").unwrap();
        assert_eq!(write.expected, Some(Revision::from_raw(1)));
        assert_eq!(write.pending.rev(), Some(Revision::from_raw(3)));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_count_delta() {
        let mut buffer = WriteBuffer::new();
        buffer.record("c", "new", None, version(5));
        buffer.record("c", "gone", Some(Revision::from_raw(1)), PendingWrite::Tombstone);
        buffer.record("c", "changed", Some(Revision::from_raw(2)), version(6));
        buffer.record("c", "ephemeral", None, PendingWrite::Tombstone);
        buffer.record("d", "x", None, version(7));

        assert_eq!(buffer.count_delta("c"), 0);
        assert_eq!(buffer.count_delta("d"), 1);
        assert_eq!(buffer.count_delta("other"), 0);
    }

    #[test]
    fn test_collections_and_clear() {
        let mut buffer = WriteBuffer::new();
        assert!(buffer.is_empty());
        buffer.record("a", "1", None, version(1));
        buffer.record("b", "2", Some(Revision::from_raw(9)), PendingWrite::Tombstone);

        let names: Vec<_> = buffer.collections().map(|(name, _)| name.clone()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(buffer.collection("b").unwrap()["2"].expected, Some(Revision::from_raw(9)));
        assert_eq!(buffer.len(), 2);

        buffer.clear();
        assert!(buffer.is_empty());
        assert!(!buffer.contains("a", "1"));
    }
}
