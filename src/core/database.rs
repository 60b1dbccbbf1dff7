use crate::core::collection::Collection;
use crate::core::conflict::ConflictDetector;
use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::locks::LockManager;
use crate::core::metrics::{Metrics, MetricsSnapshot};
use crate::core::mvcc::TransactionManager;
use crate::core::options::{ServerOptions, TransactionConfig, TransactionOptions};
use crate::core::registry::{IdleSweeper, TransactionRegistry, TransactionStatus, TxStatus};
use crate::core::server::ServerShared;
use crate::core::store::CollectionStore;
use crate::core::transaction::{Transaction, TrxState};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info};

/// One database: its collections and the services every transaction on
/// them shares (intents, conflict claims, commit order, registry).
pub struct Database {
    name: Arc<str>,
    collections: Arc<RwLock<BTreeMap<String, Arc<CollectionStore>>>>,
    pub(crate) tx_manager: Arc<TransactionManager>,
    pub(crate) locks: Arc<LockManager>,
    pub(crate) detector: Arc<ConflictDetector>,
    pub(crate) registry: Arc<TransactionRegistry>,
    pub(crate) commit_mu: Arc<Mutex<()>>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) shared: Arc<ServerShared>,
    tx_config: Arc<RwLock<TransactionConfig>>,
    cursor_ids: Arc<AtomicU64>,
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            collections: self.collections.clone(),
            tx_manager: self.tx_manager.clone(),
            locks: self.locks.clone(),
            detector: self.detector.clone(),
            registry: self.registry.clone(),
            commit_mu: self.commit_mu.clone(),
            metrics: self.metrics.clone(),
            shared: self.shared.clone(),
            tx_config: self.tx_config.clone(),
            cursor_ids: self.cursor_ids.clone(),
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Database").field("name", &self.name).finish()
    }
}

pub(crate) fn validate_name(kind: &str, name: &str) -> Result<()> {
    let valid_start = name
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    let valid_chars = name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if !valid_start || !valid_chars || name.len() > MAX_NAME_LENGTH {
        return Err(Error::bad_parameter(format!("illegal {} name '{}'", kind, name)));
    }
    Ok(())
}

impl Database {
    pub(crate) fn new(name: &str, shared: Arc<ServerShared>) -> Self {
        Self {
            name: Arc::from(name),
            collections: Arc::new(RwLock::new(BTreeMap::new())),
            tx_manager: Arc::new(TransactionManager::new()),
            locks: Arc::new(LockManager::new()),
            detector: Arc::new(ConflictDetector::new()),
            registry: Arc::new(TransactionRegistry::new(shared.options.finished_history)),
            commit_mu: Arc::new(Mutex::new(())),
            metrics: Arc::new(Metrics::new()),
            shared,
            tx_config: Arc::new(RwLock::new(TransactionConfig::default())),
            cursor_ids: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &ServerOptions {
        &self.shared.options
    }

    pub fn create_collection(&self, name: &str) -> Result<Collection> {
        validate_name("collection", name)?;

        let mut collections = self.collections.write()
            .map_err(|_| Error::LockPoisoned { lock_name: "database.collections".to_string() })?;
        if collections.contains_key(name) {
            return Err(Error::DuplicateName { name: name.to_string() });
        }
        collections.insert(name.to_string(), Arc::new(CollectionStore::new(name)));
        drop(collections);

        debug!(database = %self.name, collection = name, "created collection");
        Ok(Collection::new(self.clone(), name))
    }

    /// Drops a collection. Fails with `Locked` while any transaction holds
    /// an intent on it.
    pub fn drop_collection(&self, name: &str) -> Result<()> {
        let mut collections = self.collections.write()
            .map_err(|_| Error::LockPoisoned { lock_name: "database.collections".to_string() })?;
        if !collections.contains_key(name) {
            return Err(Error::DataSourceNotFound { name: name.to_string() });
        }
        if self.locks.holder_count(name) > 0 {
            return Err(Error::Locked {
                reason: format!("collection '{}' is in use by a transaction", name),
            });
        }
        collections.remove(name);
        drop(collections);

        debug!(database = %self.name, collection = name, "dropped collection");
        Ok(())
    }

    pub fn collection(&self, name: &str) -> Result<Collection> {
        self.store(name)?;
        Ok(Collection::new(self.clone(), name))
    }

    pub fn has_collection(&self, name: &str) -> bool {
        self.collections.read().recover_poison().contains_key(name)
    }

    pub fn list_collections(&self) -> Vec<String> {
        self.collections.read().recover_poison().keys().cloned().collect()
    }

    pub(crate) fn store(&self, name: &str) -> Result<Arc<CollectionStore>> {
        let collections = self.collections.read()
            .map_err(|_| Error::LockPoisoned { lock_name: "database.collections".to_string() })?;
        collections
            .get(name)
            .cloned()
            .ok_or_else(|| Error::DataSourceNotFound { name: name.to_string() })
    }

    /// Starts a transaction: validates the options, then waits until every
    /// declared intent is granted at once.
    pub fn begin(&self, options: TransactionOptions) -> Result<Transaction> {
        self.sweep_idle();
        self.begin_internal(options, true)
    }

    /// Like [`Database::begin`] with options in their document form.
    pub fn begin_with(&self, config: &Value) -> Result<Transaction> {
        self.begin(TransactionOptions::from_value(config)?)
    }

    pub(crate) fn begin_internal(&self, options: TransactionOptions, registered: bool) -> Result<Transaction> {
        options.validate()?;
        let intents = options.intents();
        for name in intents.keys() {
            self.store(name)?;
        }

        let id = self.shared.next_tx_id.fetch_add(1, Ordering::SeqCst);
        let wait = options.lock_wait(self.shared.options.default_lock_timeout_secs);
        if let Err(err) = self.locks.acquire(id, &intents, wait) {
            if matches!(err, Error::LockTimeout { .. }) {
                self.metrics.lock_timeout();
            }
            return Err(err);
        }

        let snapshot = match self.tx_manager.begin(id) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.locks.release_all(id);
                return Err(err);
            }
        };

        let state = Arc::new(TrxState::new(id, &self.name, snapshot, options, registered));
        if registered {
            if let Err(err) = self.registry.register(Arc::clone(&state)) {
                self.locks.release_all(id);
                let _ = self.tx_manager.finish(id);
                return Err(err);
            }
        }

        self.metrics.transaction_begun();
        debug!(trx = id, database = %self.name, snapshot, intents = intents.len(), registered, "transaction begun");
        Ok(Transaction::attach(self.clone(), state))
    }

    /// Rebuilds the handle of a transaction of this database. Ids of other
    /// databases are not found.
    pub fn transaction(&self, id: TransactionID) -> Result<Transaction> {
        self.registry
            .lookup(id)
            .map(|state| Transaction::attach(self.clone(), state))
            .ok_or(Error::TransactionNotFound { id })
    }

    /// Running transactions of this database.
    pub fn list_transactions(&self) -> Vec<TransactionStatus> {
        self.registry.list()
    }

    /// Aborts every running transaction that declared write or exclusive
    /// access. Transactions finishing concurrently are skipped. Returns how
    /// many were aborted here.
    pub fn abort_all_write_transactions(&self) -> usize {
        let mut aborted = 0;
        for state in self.registry.active() {
            if !state.declared.values().any(|mode| mode.can_write()) {
                continue;
            }
            let trx = Transaction::attach(self.clone(), state);
            if !trx.is_running() {
                continue;
            }
            if let Ok(status) = trx.abort() {
                if status.status == TxStatus::Aborted {
                    aborted += 1;
                }
            }
        }

        if aborted > 0 {
            info!(database = %self.name, aborted, "aborted write transactions");
        }
        aborted
    }

    /// Runs `f` in a new transaction and commits it. Write-write conflicts,
    /// raised by `f` or by the commit, restart the whole transaction with
    /// exponential backoff; any other error aborts and is returned.
    pub fn execute_transaction<F, R>(&self, options: TransactionOptions, f: F) -> Result<R>
    where
        F: Fn(&Transaction) -> Result<R>,
    {
        let config = self.tx_config.read()
            .map_err(|_| Error::LockPoisoned { lock_name: "database.tx_config".to_string() })?
            .clone();
        let mut last_err = None;

        for attempt in 0..=config.max_retries {
            let trx = self.begin(options.clone())?;

            let outcome = f(&trx).and_then(|result| trx.commit().map(|_| result));
            match outcome {
                Ok(result) => return Ok(result),
                Err(err) => {
                    let _ = trx.abort();
                    if !err.is_conflict() {
                        return Err(err);
                    }
                    debug!(trx = trx.id(), attempt, "retrying after conflict");
                    last_err = Some(err);
                }
            }

            if attempt < config.max_retries {
                let backoff = config.backoff(attempt);
                if !backoff.is_zero() {
                    std::thread::sleep(backoff);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::TransactionInternal {
            reason: "transaction retries exhausted".to_string(),
        }))
    }

    pub fn set_transaction_config(&self, config: TransactionConfig) {
        *self.tx_config.write().recover_poison() = config;
    }

    pub fn transaction_config(&self) -> TransactionConfig {
        self.tx_config.read().recover_poison().clone()
    }

    /// Aborts running transactions idle for longer than the configured
    /// timeout. Returns how many were aborted.
    pub fn sweep_idle(&self) -> usize {
        let Some(timeout) = self.shared.options.idle_timeout() else {
            return 0;
        };

        self.registry
            .active()
            .into_iter()
            .filter(|state| state.idle_for() >= timeout)
            .filter(|state| Transaction::attach(self.clone(), Arc::clone(state)).abort_if_idle(timeout))
            .count()
    }

    /// Starts a background thread running [`Database::sweep_idle`] every
    /// `interval` until the returned handle is dropped.
    pub fn start_idle_sweeper(&self, interval: Duration) -> Result<IdleSweeper> {
        IdleSweeper::start(self.clone(), interval)
    }

    /// Drops document versions no running transaction can read anymore.
    pub fn garbage_collect(&self) -> Result<usize> {
        let oldest = self.tx_manager.oldest_active_snapshot()?;
        let stores: Vec<_> = self.collections.read()
            .map_err(|_| Error::LockPoisoned { lock_name: "database.collections".to_string() })?
            .values()
            .cloned()
            .collect();

        let mut removed = 0;
        for store in stores {
            removed += store.garbage_collect(oldest)?;
        }

        self.metrics.versions_collected(removed);
        info!(
            database = %self.name,
            oldest_snapshot = oldest,
            active = self.tx_manager.active_count(),
            removed,
            "garbage collected versions"
        );
        Ok(removed)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) fn next_cursor_id(&self) -> u64 {
        self.cursor_ids.fetch_add(1, Ordering::Relaxed)
    }
}
