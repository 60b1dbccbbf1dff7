use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Counters collected by one database.
/// All fields are atomics so hot paths never take a lock to record.
#[derive(Debug)]
pub struct Metrics {
    // Transaction metrics
    transactions_begun: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_aborted: AtomicU64,
    transactions_idle_aborted: AtomicU64,
    active_transactions: AtomicUsize,
    synced_commits: AtomicU64,

    // Contention metrics
    transaction_conflicts: AtomicU64,
    unique_violations: AtomicU64,
    lock_timeouts: AtomicU64,

    // Operation metrics
    documents_inserted: AtomicU64,
    documents_updated: AtomicU64,
    documents_replaced: AtomicU64,
    documents_removed: AtomicU64,
    documents_read: AtomicU64,
    cursors_opened: AtomicU64,

    // Garbage collection
    versions_collected: AtomicU64,
}

/// Point-in-time copy of [`Metrics`] with derived rates.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub transactions_begun: u64,
    pub transactions_committed: u64,
    pub transactions_aborted: u64,
    pub transactions_idle_aborted: u64,
    pub active_transactions: usize,
    pub synced_commits: u64,
    pub total_transactions: u64,
    pub commit_rate: f64,

    pub transaction_conflicts: u64,
    pub unique_violations: u64,
    pub lock_timeouts: u64,

    pub documents_inserted: u64,
    pub documents_updated: u64,
    pub documents_replaced: u64,
    pub documents_removed: u64,
    pub documents_read: u64,
    pub total_document_operations: u64,
    pub cursors_opened: u64,

    pub versions_collected: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            transactions_begun: AtomicU64::new(0),
            transactions_committed: AtomicU64::new(0),
            transactions_aborted: AtomicU64::new(0),
            transactions_idle_aborted: AtomicU64::new(0),
            active_transactions: AtomicUsize::new(0),
            synced_commits: AtomicU64::new(0),

            transaction_conflicts: AtomicU64::new(0),
            unique_violations: AtomicU64::new(0),
            lock_timeouts: AtomicU64::new(0),

            documents_inserted: AtomicU64::new(0),
            documents_updated: AtomicU64::new(0),
            documents_replaced: AtomicU64::new(0),
            documents_removed: AtomicU64::new(0),
            documents_read: AtomicU64::new(0),
            cursors_opened: AtomicU64::new(0),

            versions_collected: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn transaction_begun(&self) {
        self.transactions_begun.fetch_add(1, Ordering::Relaxed);
        self.active_transactions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn transaction_committed(&self, wait_for_sync: bool) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
        self.active_transactions.fetch_sub(1, Ordering::Relaxed);
        if wait_for_sync {
            self.synced_commits.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn transaction_aborted(&self) {
        self.transactions_aborted.fetch_add(1, Ordering::Relaxed);
        self.active_transactions.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn transaction_idle_aborted(&self) {
        self.transactions_idle_aborted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn transaction_conflict(&self) {
        self.transaction_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn unique_violation(&self) {
        self.unique_violations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn lock_timeout(&self) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn document_inserted(&self) {
        self.documents_inserted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn document_updated(&self) {
        self.documents_updated.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn document_replaced(&self) {
        self.documents_replaced.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn document_removed(&self) {
        self.documents_removed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn document_read(&self) {
        self.documents_read.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn cursor_opened(&self) {
        self.cursors_opened.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn versions_collected(&self, count: usize) {
        self.versions_collected.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let transactions_committed = self.transactions_committed.load(Ordering::Relaxed);
        let transactions_aborted = self.transactions_aborted.load(Ordering::Relaxed);
        let total_transactions = transactions_committed + transactions_aborted;
        let commit_rate = if total_transactions > 0 {
            transactions_committed as f64 / total_transactions as f64
        } else {
            0.0
        };

        let documents_inserted = self.documents_inserted.load(Ordering::Relaxed);
        let documents_updated = self.documents_updated.load(Ordering::Relaxed);
        let documents_replaced = self.documents_replaced.load(Ordering::Relaxed);
        let documents_removed = self.documents_removed.load(Ordering::Relaxed);
        let documents_read = self.documents_read.load(Ordering::Relaxed);

        MetricsSnapshot {
            transactions_begun: self.transactions_begun.load(Ordering::Relaxed),
            transactions_committed,
            transactions_aborted,
            transactions_idle_aborted: self.transactions_idle_aborted.load(Ordering::Relaxed),
            active_transactions: self.active_transactions.load(Ordering::Relaxed),
            synced_commits: self.synced_commits.load(Ordering::Relaxed),
            total_transactions,
            commit_rate,

            transaction_conflicts: self.transaction_conflicts.load(Ordering::Relaxed),
            unique_violations: self.unique_violations.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),

            documents_inserted,
            documents_updated,
            documents_replaced,
            documents_removed,
            documents_read,
            total_document_operations: documents_inserted
                + documents_updated
                + documents_replaced
                + documents_removed
                + documents_read,
            cursors_opened: self.cursors_opened.load(Ordering::Relaxed),

            versions_collected: self.versions_collected.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
