use crate::core::constants::*;
use crate::core::database::Database;
use crate::core::errors::*;
use crate::core::transaction::TrxState;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Running,
    Committed,
    Aborted,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Running => "running",
            TxStatus::Committed => "committed",
            TxStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TxStatus::Running)
    }

    pub(crate) fn as_u8(&self) -> u8 {
        match self {
            TxStatus::Running => 0,
            TxStatus::Committed => 1,
            TxStatus::Aborted => 2,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TxStatus::Running,
            1 => TxStatus::Committed,
            _ => TxStatus::Aborted,
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{id, status}` as reported by commit, abort, status and listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionStatus {
    pub id: TransactionID,
    pub status: TxStatus,
}

/// Directory of the transactions of one database.
///
/// Running transactions are looked up by id; finished ones are kept in a
/// bounded history so their final status can still be queried.
pub struct TransactionRegistry {
    active: RwLock<HashMap<TransactionID, Arc<TrxState>>>,
    finished: Mutex<VecDeque<Arc<TrxState>>>,
    history: usize,
}

impl TransactionRegistry {
    pub fn new(history: usize) -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            finished: Mutex::new(VecDeque::new()),
            history,
        }
    }

    pub(crate) fn register(&self, state: Arc<TrxState>) -> Result<()> {
        let mut active = self.active.write()
            .map_err(|_| Error::LockPoisoned { lock_name: "registry.active".to_string() })?;
        active.insert(state.id, state);
        Ok(())
    }

    /// Moves a transaction from the active map into the finished history.
    pub(crate) fn finish(&self, id: TransactionID) {
        let removed = self.active.write().recover_poison().remove(&id);
        let Some(state) = removed else {
            return;
        };

        if self.history == 0 {
            return;
        }
        let mut finished = self.finished.lock().recover_poison();
        if finished.len() >= self.history {
            finished.pop_front();
        }
        finished.push_back(state);
    }

    /// Running or recently finished transaction with `id`.
    pub(crate) fn lookup(&self, id: TransactionID) -> Option<Arc<TrxState>> {
        if let Some(state) = self.active.read().recover_poison().get(&id) {
            return Some(Arc::clone(state));
        }
        self.finished
            .lock()
            .recover_poison()
            .iter()
            .find(|state| state.id == id)
            .cloned()
    }

    pub(crate) fn active(&self) -> Vec<Arc<TrxState>> {
        let mut states: Vec<_> = self.active.read().recover_poison().values().cloned().collect();
        states.sort_by_key(|state| state.id);
        states
    }

    pub fn list(&self) -> Vec<TransactionStatus> {
        self.active()
            .iter()
            .map(|state| TransactionStatus {
                id: state.id,
                status: state.status(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.active.read().recover_poison().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Background thread that aborts idle transactions of one database until
/// the handle is dropped.
pub struct IdleSweeper {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl IdleSweeper {
    pub(crate) fn start(db: Database, interval: Duration) -> Result<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let flag = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name(format!("trxdoc-sweeper-{}", db.name()))
            .spawn(move || {
                let (lock, cvar) = &*flag;
                loop {
                    let Ok(guard) = lock.lock() else {
                        return;
                    };
                    let Ok((stopped, _)) = cvar.wait_timeout_while(guard, interval, |stopped| !*stopped) else {
                        return;
                    };
                    if *stopped {
                        return;
                    }
                    drop(stopped);
                    db.sweep_idle();
                }
            })
            .map_err(|e| Error::TransactionInternal {
                reason: format!("failed to start idle sweeper: {}", e),
            })?;

        debug!(interval_ms = interval.as_millis() as u64, "idle sweeper started");
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stops the thread and waits for it to exit.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for IdleSweeper {
    fn drop(&mut self) {
        let (lock, cvar) = &*self.stop;
        *lock.lock().recover_poison() = true;
        cvar.notify_all();

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
