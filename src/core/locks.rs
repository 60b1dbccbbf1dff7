use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::options::AccessMode;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Holders {
    shared: HashMap<TransactionID, AccessMode>,
    exclusive: Option<TransactionID>,
    /// Exclusive requests still waiting, keyed by arrival ticket.
    queued: BTreeMap<u64, TransactionID>,
}

impl Holders {
    /// Shared requests also wait behind exclusive requests that arrived
    /// before them, so a stream of readers cannot starve an exclusive one.
    fn grantable(&self, tx_id: TransactionID, mode: AccessMode, ticket: u64) -> bool {
        if let Some(owner) = self.exclusive {
            return owner == tx_id;
        }
        match mode {
            AccessMode::Exclusive => self.shared.keys().all(|holder| *holder == tx_id),
            AccessMode::Read | AccessMode::Write => {
                self.queued.range(..ticket).all(|(_, waiter)| *waiter == tx_id)
            }
        }
    }

    fn grant(&mut self, tx_id: TransactionID, mode: AccessMode) {
        match mode {
            AccessMode::Exclusive => {
                self.shared.remove(&tx_id);
                self.exclusive = Some(tx_id);
            }
            _ if self.exclusive == Some(tx_id) => {}
            _ => {
                let held = self.shared.entry(tx_id).or_insert(mode);
                if mode > *held {
                    *held = mode;
                }
            }
        }
    }

    fn release(&mut self, tx_id: TransactionID) -> bool {
        let mut released = self.shared.remove(&tx_id).is_some();
        if self.exclusive == Some(tx_id) {
            self.exclusive = None;
            released = true;
        }
        released
    }

    fn is_empty(&self) -> bool {
        self.shared.is_empty() && self.exclusive.is_none() && self.queued.is_empty()
    }
}

type LockTable = HashMap<String, Holders>;

fn first_blocked<'a>(
    table: &LockTable,
    tx_id: TransactionID,
    requests: &'a BTreeMap<String, AccessMode>,
    ticket: u64,
) -> Option<(&'a String, &'a AccessMode)> {
    requests.iter().find(|(name, mode)| {
        table
            .get(*name)
            .map(|holders| !holders.grantable(tx_id, **mode, ticket))
            .unwrap_or(false)
    })
}

fn grant_all(table: &mut LockTable, tx_id: TransactionID, requests: &BTreeMap<String, AccessMode>) {
    for (name, mode) in requests {
        table.entry(name.clone()).or_default().grant(tx_id, *mode);
    }
}

fn enqueue(table: &mut LockTable, tx_id: TransactionID, requests: &BTreeMap<String, AccessMode>, ticket: u64) {
    for (name, mode) in requests {
        if *mode == AccessMode::Exclusive {
            table.entry(name.clone()).or_default().queued.insert(ticket, tx_id);
        }
    }
}

fn dequeue(table: &mut LockTable, requests: &BTreeMap<String, AccessMode>, ticket: u64) {
    for (name, mode) in requests {
        if *mode != AccessMode::Exclusive {
            continue;
        }
        if let Some(holders) = table.get_mut(name) {
            holders.queued.remove(&ticket);
            if holders.is_empty() {
                table.remove(name);
            }
        }
    }
}

/// Collection-level intents of one database.
///
/// A request for several collections is granted all at once or not at
/// all. Waiting requests hold nothing, and a transaction that already
/// holds intents can only widen them with [`LockManager::try_acquire`],
/// which never waits. So two transactions can never wait on each other.
pub struct LockManager {
    table: Mutex<LockTable>,
    released: Condvar,
    tickets: AtomicU64,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            tickets: AtomicU64::new(0),
        }
    }

    /// Blocks until every intent in `requests` is granted to `tx_id`, or
    /// fails with `LockTimeout` once `timeout` elapses. `None` waits forever.
    pub fn acquire(
        &self,
        tx_id: TransactionID,
        requests: &BTreeMap<String, AccessMode>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if requests.is_empty() {
            return Ok(());
        }

        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut table = self.table.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "locks.table".to_string() })?;
        let mut queued = false;

        loop {
            let Some((name, mode)) = first_blocked(&table, tx_id, requests, ticket) else {
                if queued {
                    dequeue(&mut table, requests, ticket);
                }
                grant_all(&mut table, tx_id, requests);
                debug!(trx = tx_id, intents = requests.len(), "granted intents");
                return Ok(());
            };

            if !queued {
                enqueue(&mut table, tx_id, requests, ticket);
                queued = true;
            }

            match deadline {
                None => {
                    table = self.released.wait(table)
                        .map_err(|_| Error::LockPoisoned { lock_name: "locks.table".to_string() })?;
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        dequeue(&mut table, requests, ticket);
                        drop(table);
                        // Shared requests queued behind this one may now proceed.
                        self.released.notify_all();

                        let timeout_secs = timeout.map(|t| t.as_secs_f64()).unwrap_or(0.0);
                        warn!(trx = tx_id, collection = %name, mode = mode.as_str(), timeout_secs, "lock timeout");
                        return Err(Error::LockTimeout {
                            collection: name.clone(),
                            mode: mode.as_str().to_string(),
                            timeout_secs,
                        });
                    }
                    table = self.released.wait_timeout(table, deadline - now)
                        .map_err(|_| Error::LockPoisoned { lock_name: "locks.table".to_string() })?
                        .0;
                }
            }
        }
    }

    /// Grants every intent in `requests` only if all are available right
    /// now, failing with a zero-second `LockTimeout` otherwise. Used to
    /// widen the intents of a running transaction.
    pub fn try_acquire(&self, tx_id: TransactionID, requests: &BTreeMap<String, AccessMode>) -> Result<()> {
        let mut table = self.table.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "locks.table".to_string() })?;

        if let Some((name, mode)) = first_blocked(&table, tx_id, requests, u64::MAX) {
            debug!(trx = tx_id, collection = %name, mode = mode.as_str(), "intent not available");
            return Err(Error::LockTimeout {
                collection: name.clone(),
                mode: mode.as_str().to_string(),
                timeout_secs: 0.0,
            });
        }
        grant_all(&mut table, tx_id, requests);
        Ok(())
    }

    pub fn release_all(&self, tx_id: TransactionID) {
        let mut table = self.table.lock().recover_poison();
        let mut released = 0;
        table.retain(|_, holders| {
            if holders.release(tx_id) {
                released += 1;
            }
            !holders.is_empty()
        });
        drop(table);

        if released > 0 {
            debug!(trx = tx_id, released, "released intents");
            self.released.notify_all();
        }
    }

    #[cfg(test)]
    pub(crate) fn mode_of(&self, tx_id: TransactionID, collection: &str) -> Option<AccessMode> {
        let table = self.table.lock().recover_poison();
        let holders = table.get(collection)?;
        if holders.exclusive == Some(tx_id) {
            return Some(AccessMode::Exclusive);
        }
        holders.shared.get(&tx_id).copied()
    }

    #[cfg(test)]
    pub(crate) fn queued_exclusive(&self, collection: &str) -> usize {
        let table = self.table.lock().recover_poison();
        table.get(collection).map(|h| h.queued.len()).unwrap_or(0)
    }

    /// Number of transactions holding any intent on `collection`.
    pub fn holder_count(&self, collection: &str) -> usize {
        let table = self.table.lock().recover_poison();
        table
            .get(collection)
            .map(|h| h.shared.len() + usize::from(h.exclusive.is_some()))
            .unwrap_or(0)
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
