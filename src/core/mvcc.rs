use crate::core::constants::*;
use crate::core::document::Revision;
use crate::core::errors::*;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Tracks the commit sequence of one database and the snapshot each
/// running transaction reads from.
pub struct TransactionManager {
    last_committed: AtomicU64,
    snapshots: RwLock<HashMap<TransactionID, CommitSeq>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            last_committed: AtomicU64::new(0),
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Pins the current commit sequence as the snapshot of `tx_id`.
    pub fn begin(&self, tx_id: TransactionID) -> Result<CommitSeq> {
        let mut snapshots = self.snapshots.write()
            .map_err(|_| Error::LockPoisoned { lock_name: "mvcc.snapshots".to_string() })?;
        let snapshot = self.last_committed();
        snapshots.insert(tx_id, snapshot);
        Ok(snapshot)
    }

    pub fn finish(&self, tx_id: TransactionID) -> Result<()> {
        let mut snapshots = self.snapshots.write()
            .map_err(|_| Error::LockPoisoned { lock_name: "mvcc.snapshots".to_string() })?;
        snapshots.remove(&tx_id);
        Ok(())
    }

    /// Sequence the next commit will publish. Only meaningful while the
    /// caller holds the database commit mutex.
    pub fn next_commit_seq(&self) -> CommitSeq {
        self.last_committed() + 1
    }

    pub fn publish(&self, seq: CommitSeq) {
        self.last_committed.fetch_max(seq, Ordering::SeqCst);
    }

    pub fn last_committed(&self) -> CommitSeq {
        self.last_committed.load(Ordering::SeqCst)
    }

    /// Oldest snapshot any running transaction can still read. Versions
    /// retired at or before it are unreachable.
    pub fn oldest_active_snapshot(&self) -> Result<CommitSeq> {
        let snapshots = self.snapshots.read()
            .map_err(|_| Error::LockPoisoned { lock_name: "mvcc.snapshots".to_string() })?;

        Ok(snapshots
            .values()
            .copied()
            .min()
            .unwrap_or_else(|| self.last_committed()))
    }

    pub fn active_count(&self) -> usize {
        self.snapshots.read().recover_poison().len()
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct DocumentVersion {
    pub rev: Revision,
    pub xmin: CommitSeq,
    pub xmax: CommitSeq,
    pub data: Arc<Map<String, Value>>,
}

impl DocumentVersion {
    pub fn new(rev: Revision, xmin: CommitSeq, data: Arc<Map<String, Value>>) -> Self {
        Self { rev, xmin, xmax: 0, data }
    }

    pub fn is_visible(&self, snapshot: CommitSeq) -> bool {
        if self.xmin > snapshot {
            return false;
        }

        if self.xmax != 0 && self.xmax <= snapshot {
            return false;
        }

        true
    }

    pub fn is_live(&self) -> bool {
        self.xmax == 0
    }
}

/// All committed versions of one document key, oldest first.
#[derive(Debug, Clone, Default)]
pub struct VersionChain {
    versions: Vec<DocumentVersion>,
}

impl VersionChain {
    pub fn new() -> Self {
        Self { versions: Vec::new() }
    }

    pub fn visible(&self, snapshot: CommitSeq) -> Option<&DocumentVersion> {
        self.versions.iter().rev().find(|v| v.is_visible(snapshot))
    }

    pub fn latest(&self) -> Option<&DocumentVersion> {
        self.versions.last().filter(|v| v.is_live())
    }

    /// Ends the live version at `seq`, returning it.
    pub fn retire(&mut self, seq: CommitSeq) -> Option<&DocumentVersion> {
        let live = self.versions.last_mut().filter(|v| v.is_live())?;
        live.xmax = seq;
        Some(live)
    }

    pub fn push(&mut self, version: DocumentVersion) {
        self.versions.push(version);
    }

    /// Drops versions no snapshot at or after `oldest_active` can see.
    pub fn garbage_collect(&mut self, oldest_active: CommitSeq) -> usize {
        let before = self.versions.len();
        self.versions.retain(|v| v.xmax == 0 || v.xmax > oldest_active);
        before - self.versions.len()
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}
