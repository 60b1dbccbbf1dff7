use crate::core::database::{validate_name, Database};
use crate::core::document::RevisionClock;
use crate::core::errors::*;
use crate::core::options::ServerOptions;
use crate::core::transaction::Transaction;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// State shared by every database of a server.
pub(crate) struct ServerShared {
    pub revisions: RevisionClock,
    pub next_tx_id: AtomicU64,
    pub options: ServerOptions,
}

/// Entry point: a set of named databases sharing one revision clock and
/// one transaction id space.
pub struct Server {
    databases: Arc<RwLock<BTreeMap<String, Database>>>,
    shared: Arc<ServerShared>,
}

impl Clone for Server {
    fn clone(&self) -> Self {
        Self {
            databases: self.databases.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl Server {
    pub fn new(options: ServerOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self::with_options(options))
    }

    fn with_options(options: ServerOptions) -> Self {
        info!(
            idle_timeout_ms = options.idle_timeout_ms,
            lock_timeout_secs = options.default_lock_timeout_secs,
            "server started"
        );

        Self {
            databases: Arc::new(RwLock::new(BTreeMap::new())),
            shared: Arc::new(ServerShared {
                revisions: RevisionClock::new(),
                next_tx_id: AtomicU64::new(1),
                options,
            }),
        }
    }

    pub fn options(&self) -> &ServerOptions {
        &self.shared.options
    }

    pub fn create_database(&self, name: &str) -> Result<Database> {
        validate_name("database", name)?;

        let mut databases = self.databases.write()
            .map_err(|_| Error::LockPoisoned { lock_name: "server.databases".to_string() })?;
        if databases.contains_key(name) {
            return Err(Error::DuplicateName { name: name.to_string() });
        }

        let db = Database::new(name, Arc::clone(&self.shared));
        databases.insert(name.to_string(), db.clone());
        debug!(database = name, "created database");
        Ok(db)
    }

    pub fn database(&self, name: &str) -> Result<Database> {
        self.databases
            .read()
            .map_err(|_| Error::LockPoisoned { lock_name: "server.databases".to_string() })?
            .get(name)
            .cloned()
            .ok_or_else(|| Error::DatabaseNotFound { name: name.to_string() })
    }

    /// Removes a database after aborting its running transactions. Handles
    /// still held elsewhere keep working on the detached data.
    pub fn drop_database(&self, name: &str) -> Result<()> {
        let db = self.databases
            .write()
            .map_err(|_| Error::LockPoisoned { lock_name: "server.databases".to_string() })?
            .remove(name)
            .ok_or_else(|| Error::DatabaseNotFound { name: name.to_string() })?;

        let mut aborted = 0;
        for state in db.registry.active() {
            if Transaction::attach(db.clone(), state).abort().is_ok() {
                aborted += 1;
            }
        }

        info!(database = name, aborted, "dropped database");
        Ok(())
    }

    pub fn list_databases(&self) -> Vec<String> {
        self.databases.read().recover_poison().keys().cloned().collect()
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::with_options(ServerOptions::default())
    }
}
