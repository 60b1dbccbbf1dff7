use crate::core::buffer::WriteBuffer;
use crate::core::conflict::ConflictToken;
use crate::core::constants::*;
use crate::core::cursor::Cursor;
use crate::core::database::Database;
use crate::core::errors::*;
use crate::core::options::{AccessMode, QueryOptions, TransactionOptions};
use crate::core::registry::{TransactionStatus, TxStatus};
use crate::core::tx_collection::{DocumentOps, TxCollection};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Mutable state of a transaction, guarded by one mutex so operations on
/// a single transaction are serialized.
#[derive(Debug, Default)]
pub(crate) struct TrxInner {
    /// Declared intents plus read intents added implicitly by queries.
    pub intents: BTreeMap<String, AccessMode>,
    pub buffer: WriteBuffer,
    /// Keys claimed in the conflict detector.
    pub claims: Vec<(String, String)>,
    pub live_cursor: Option<u64>,
    pub operations: usize,
}

/// Shared state behind every handle of one transaction. The registry keeps
/// it so a handle can be rebuilt from the id alone.
#[derive(Debug)]
pub(crate) struct TrxState {
    pub id: TransactionID,
    pub database: String,
    pub snapshot: CommitSeq,
    pub options: TransactionOptions,
    pub declared: BTreeMap<String, AccessMode>,
    pub registered: bool,
    status: AtomicU8,
    created_at: Instant,
    last_activity_ms: AtomicU64,
    pub inner: Mutex<TrxInner>,
}

impl TrxState {
    pub fn new(
        id: TransactionID,
        database: &str,
        snapshot: CommitSeq,
        options: TransactionOptions,
        registered: bool,
    ) -> Self {
        let declared = options.intents();
        Self {
            id,
            database: database.to_string(),
            snapshot,
            inner: Mutex::new(TrxInner {
                intents: declared.clone(),
                ..TrxInner::default()
            }),
            declared,
            options,
            registered,
            status: AtomicU8::new(TxStatus::Running.as_u8()),
            created_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> TxStatus {
        TxStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, status: TxStatus) {
        self.status.store(status.as_u8(), Ordering::SeqCst);
    }

    pub fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.created_at.elapsed().saturating_sub(last)
    }
}

/// A running or finished transaction of one database.
///
/// Handles are cheap clones; every clone, and every handle rebuilt with
/// [`Database::transaction`], drives the same transaction.
#[derive(Clone)]
pub struct Transaction {
    state: Arc<TrxState>,
    db: Database,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.state.id)
            .field("database", &self.state.database)
            .field("status", &self.state.status())
            .finish()
    }
}

impl Transaction {
    pub(crate) fn attach(db: Database, state: Arc<TrxState>) -> Self {
        Self { state, db }
    }

    pub fn id(&self) -> TransactionID {
        self.state.id
    }

    pub fn database_name(&self) -> &str {
        &self.state.database
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.state.options
    }

    pub fn status(&self) -> TransactionStatus {
        TransactionStatus {
            id: self.state.id,
            status: self.state.status(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.status() == TxStatus::Running
    }

    /// Current intents, including read intents widened by queries.
    pub fn collections(&self) -> BTreeMap<String, AccessMode> {
        self.state.inner.lock().recover_poison().intents.clone()
    }

    /// Number of buffered document writes.
    pub fn pending_writes(&self) -> usize {
        self.state.inner.lock().recover_poison().buffer.len()
    }

    /// Access handle for a collection declared at creation. Collections
    /// only reached implicitly by queries are not available here.
    pub fn collection(&self, name: &str) -> Result<TxCollection<'_>> {
        self.ensure_running()?;
        if !self.state.declared.contains_key(name) {
            return Err(Error::UnregisteredCollection {
                collection: name.to_string(),
                access: AccessMode::Read.as_str().to_string(),
            });
        }
        self.db.store(name)?;
        Ok(TxCollection::new(self, name))
    }

    /// Runs a query against this transaction's view. Only one cursor may be
    /// open per transaction.
    pub fn query(&self, text: &str, bind_vars: &Value, options: QueryOptions) -> Result<Cursor> {
        Cursor::open(self, text, bind_vars, options)
    }

    /// Validates every buffered write against the committed state and
    /// publishes them atomically. On failure nothing is applied and the
    /// transaction stays running.
    pub fn commit(&self) -> Result<TransactionStatus> {
        let mut inner = self.lock_inner()?;
        let status = self.state.status();
        if status.is_terminal() {
            return Ok(TransactionStatus { id: self.state.id, status });
        }
        self.state.touch();

        if !inner.buffer.is_empty() {
            self.publish(&inner)?;
        }
        if self.state.options.wait_for_sync {
            debug!(trx = self.state.id, "commit requested waitForSync");
        }

        self.finish(&mut inner, TxStatus::Committed);
        Ok(self.status())
    }

    /// Discards buffered writes and releases everything the transaction
    /// holds. Returns the final status without effect once terminal.
    pub fn abort(&self) -> Result<TransactionStatus> {
        let mut inner = self.state.inner.lock().recover_poison();
        let status = self.state.status();
        if status.is_terminal() {
            return Ok(TransactionStatus { id: self.state.id, status });
        }

        self.finish(&mut inner, TxStatus::Aborted);
        Ok(self.status())
    }

    fn publish(&self, inner: &TrxInner) -> Result<()> {
        let db = &self.db;
        let _commit = db.commit_mu.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "database.commit_mu".to_string() })?;

        let mut targets = Vec::new();
        for (name, writes) in inner.buffer.collections() {
            let store = db.store(name)?;
            for (key, write) in writes {
                let token = ConflictToken {
                    collection: name.clone(),
                    key: key.clone(),
                    expected: write.expected,
                };
                let actual = store.latest_rev(key)?;
                if let Err(err) = db.detector.validate(&token, actual, write.pending.rev()).into_result(&token) {
                    db.metrics.transaction_conflict();
                    warn!(trx = self.state.id, collection = %name, key = %key, "commit conflict");
                    return Err(err);
                }

                if let Some(payload) = write.pending.payload() {
                    if let Some(err) = store.unique_violation(payload, key, |holder| writes.contains_key(holder))? {
                        db.metrics.unique_violation();
                        return Err(err);
                    }
                }
            }
            targets.push((store, writes));
        }

        let seq = db.tx_manager.next_commit_seq();
        for (store, writes) in &targets {
            store.apply(seq, writes.iter().map(|(key, write)| (key, &write.pending)))?;
        }
        db.tx_manager.publish(seq);

        debug!(trx = self.state.id, seq, writes = inner.buffer.len(), "published commit");
        Ok(())
    }

    fn finish(&self, inner: &mut TrxInner, status: TxStatus) {
        let db = &self.db;
        let id = self.state.id;

        self.state.set_status(status);
        inner.buffer.clear();
        inner.live_cursor = None;

        let claims = std::mem::take(&mut inner.claims);
        db.detector.release_all(id, &claims);
        db.locks.release_all(id);
        if let Err(err) = db.tx_manager.finish(id) {
            warn!(trx = id, error = %err, "failed to release snapshot");
        }
        if self.state.registered {
            db.registry.finish(id);
        }

        match status {
            TxStatus::Committed => db.metrics.transaction_committed(self.state.options.wait_for_sync),
            _ => db.metrics.transaction_aborted(),
        }
        debug!(trx = id, database = %self.state.database, status = %status, "transaction finished");
    }

    /// Aborts the transaction if it has been idle for at least `timeout`.
    /// A transaction busy with an operation is never idle.
    pub(crate) fn abort_if_idle(&self, timeout: Duration) -> bool {
        let mut inner = match self.state.inner.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return false,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let idle = self.state.idle_for();
        if self.state.status().is_terminal() || idle < timeout {
            return false;
        }

        self.finish(&mut inner, TxStatus::Aborted);
        self.db.metrics.transaction_idle_aborted();
        info!(trx = self.state.id, database = %self.state.database, idle_ms = idle.as_millis() as u64, "aborted idle transaction");
        true
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        match self.state.status() {
            TxStatus::Running => Ok(()),
            status => Err(Error::TransactionNotRunning {
                id: self.state.id,
                status: status.to_string(),
            }),
        }
    }

    pub(crate) fn lock_inner(&self) -> Result<MutexGuard<'_, TrxInner>> {
        self.state.inner.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: format!("trx.{}", self.state.id) })
    }

    /// Runs `f` against the transaction's view while holding its state lock.
    pub(crate) fn with_ops<T>(&self, f: impl FnOnce(&mut DocumentOps<'_>) -> Result<T>) -> Result<T> {
        let mut inner = self.lock_inner()?;
        self.ensure_running()?;
        self.state.touch();

        let mut ops = DocumentOps::new(&self.db, &self.state, &mut inner);
        f(&mut ops)
    }

    pub(crate) fn state(&self) -> &Arc<TrxState> {
        &self.state
    }

    pub(crate) fn db(&self) -> &Database {
        &self.db
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::server::Server;
    use crate::core::options::ServerOptions;
    use serde_json::json;

    fn setup() -> Database {
        let server = Server::new(ServerOptions::default()).unwrap();
        let db = server.create_database("test").unwrap();
        db.create_collection("c").unwrap();
        db
    }

    #[test]
    fn test_commit_publishes_buffer() {
        let db = setup();
        let trx = db.begin(TransactionOptions::new().write(["c"])).unwrap();
        trx.collection("c").unwrap().insert(json!({"_key": "x", "v": 1})).unwrap();
        assert_eq!(trx.pending_writes(), 1);
        assert_eq!(db.collection("c").unwrap().count().unwrap(), 0);

        let status = trx.commit().unwrap();
        assert_eq!(status.status, TxStatus::Committed);
        assert_eq!(db.collection("c").unwrap().document("x").unwrap()["v"], 1);
        assert_eq!(trx.pending_writes(), 0);
    }

    #[test]
    fn test_terminal_transitions_are_sticky() {
        let db = setup();
        let trx = db.begin(TransactionOptions::new().write(["c"])).unwrap();
        assert_eq!(trx.abort().unwrap().status, TxStatus::Aborted);
        assert_eq!(trx.abort().unwrap().status, TxStatus::Aborted);
        assert_eq!(trx.commit().unwrap().status, TxStatus::Aborted);

        let err = trx.collection("c").unwrap_err();
        assert_eq!(err.code(), 1654);
    }

    #[test]
    fn test_undeclared_collection_is_rejected() {
        let db = setup();
        db.create_collection("other").unwrap();
        let trx = db.begin(TransactionOptions::new().read(["c"])).unwrap();

        let err = trx.collection("other").unwrap_err();
        assert_eq!(err.code(), 1652);
        assert!(trx.is_running());
    }

    #[test]
    fn test_idle_abort_skips_recent_activity() {
        let db = setup();
        let trx = db.begin(TransactionOptions::new().write(["c"])).unwrap();
        assert!(!trx.abort_if_idle(Duration::from_secs(60)));
        assert!(trx.abort_if_idle(Duration::ZERO));
        assert_eq!(trx.status().status, TxStatus::Aborted);
    }

    #[test]
    fn test_finish_releases_intents_and_claims() {
        let db = setup();
        let trx = db.begin(TransactionOptions::new().exclusive(["c"])).unwrap();
        trx.collection("c").unwrap().insert(json!({"_key": "k"})).unwrap();
        assert_eq!(db.locks.holder_count("c"), 1);
        assert_eq!(db.detector.claim_count(), 1);

        trx.abort().unwrap();
        assert_eq!(db.locks.holder_count("c"), 0);
        assert_eq!(db.detector.claim_count(), 0);
    }
}
