use crate::core::database::Database;
use crate::core::errors::*;
use crate::core::options::{AccessMode, QueryOptions};
use crate::core::query::{self, Executor, Plan};
use crate::core::transaction::{Transaction, TrxInner, TrxState};
use crate::core::tx_collection::DocumentOps;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

pub use crate::core::query::QueryStats;

enum Rows {
    Buffered(VecDeque<Value>),
    Streaming(Box<Executor>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    Live,
    Exhausted,
    Disposed,
}

/// Rows of one query run inside a transaction.
///
/// A transaction has at most one live cursor. The cursor stops being live
/// once all rows were read, when it is disposed or dropped, and when its
/// transaction commits or aborts.
pub struct Cursor {
    id: u64,
    trx: Transaction,
    rows: Rows,
    count: Option<usize>,
    stats: QueryStats,
    state: CursorState,
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("id", &self.id)
            .field("trx", &self.trx.id())
            .field("state", &self.state)
            .finish()
    }
}

impl Cursor {
    pub(crate) fn open(trx: &Transaction, text: &str, bind_vars: &Value, options: QueryOptions) -> Result<Cursor> {
        let plan = query::prepare(text, bind_vars)?;

        let db = trx.db();
        let state = trx.state();
        let mut inner = trx.lock_inner()?;
        trx.ensure_running()?;
        state.touch();

        if let Some(open) = inner.live_cursor {
            return Err(Error::Locked {
                reason: format!("transaction {} already has open cursor {}", state.id, open),
            });
        }
        resolve_access(db, state, &mut inner, &plan)?;

        let id = db.next_cursor_id();
        let modification = plan.is_modification();
        let mut executor = Executor::new(plan);
        db.metrics.cursor_opened();

        let cursor = if options.stream {
            inner.live_cursor = Some(id);
            Cursor {
                id,
                trx: trx.clone(),
                rows: Rows::Streaming(Box::new(executor)),
                count: None,
                stats: QueryStats::default(),
                state: CursorState::Live,
            }
        } else {
            let mut rows = VecDeque::new();
            let mut ops = DocumentOps::new(db, state, &mut inner);
            while let Some(row) = executor.next_row(&mut ops)? {
                rows.push_back(row);
            }

            let cursor_state = if rows.is_empty() {
                CursorState::Exhausted
            } else {
                inner.live_cursor = Some(id);
                CursorState::Live
            };
            Cursor {
                id,
                trx: trx.clone(),
                count: options.count.then_some(rows.len()),
                rows: Rows::Buffered(rows),
                stats: executor.stats().clone(),
                state: cursor_state,
            }
        };

        debug!(trx = state.id, cursor = id, stream = options.stream, modification, "opened cursor");
        Ok(cursor)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Total number of rows, when requested with `count` on a
    /// non-streaming query.
    pub fn count(&self) -> Option<usize> {
        self.count
    }

    pub fn stats(&self) -> &QueryStats {
        &self.stats
    }

    pub fn has_more(&self) -> bool {
        self.state == CursorState::Live
    }

    /// Next row, or `None` once the query is exhausted. Fails with
    /// `CursorNotFound` after disposal or after the transaction finished.
    pub fn next(&mut self) -> Result<Option<Value>> {
        match self.state {
            CursorState::Disposed => return Err(Error::CursorNotFound { id: self.id }),
            CursorState::Exhausted => return Ok(None),
            CursorState::Live => {}
        }

        let trx = self.trx.clone();
        let mut inner = trx.lock_inner()?;
        if inner.live_cursor != Some(self.id) || !trx.is_running() {
            self.state = CursorState::Disposed;
            return Err(Error::CursorNotFound { id: self.id });
        }
        trx.state().touch();

        let (row, exhausted) = match &mut self.rows {
            Rows::Buffered(rows) => {
                let row = rows.pop_front();
                (row, rows.is_empty())
            }
            Rows::Streaming(executor) => {
                let mut ops = DocumentOps::new(trx.db(), trx.state(), &mut inner);
                let produced = executor.next_row(&mut ops);
                self.stats = executor.stats().clone();
                match produced {
                    Ok(row) => {
                        let exhausted = row.is_none() || executor.is_done();
                        (row, exhausted)
                    }
                    Err(err) => {
                        inner.live_cursor = None;
                        self.state = CursorState::Disposed;
                        return Err(err);
                    }
                }
            }
        };

        if exhausted {
            inner.live_cursor = None;
            self.state = CursorState::Exhausted;
        }
        Ok(row)
    }

    pub fn next_batch(&mut self, size: usize) -> Result<Vec<Value>> {
        let mut batch = Vec::with_capacity(size.min(1024));
        while batch.len() < size {
            match self.next()? {
                Some(row) => batch.push(row),
                None => break,
            }
        }
        Ok(batch)
    }

    pub fn collect_all(&mut self) -> Result<Vec<Value>> {
        let mut all = Vec::new();
        while let Some(row) = self.next()? {
            all.push(row);
        }
        Ok(all)
    }

    /// Releases the cursor. The transaction is not affected and may open
    /// another cursor afterwards.
    pub fn dispose(&mut self) {
        if self.state == CursorState::Disposed {
            return;
        }
        if self.state == CursorState::Live {
            let mut inner = self.trx.state().inner.lock().recover_poison();
            if inner.live_cursor == Some(self.id) {
                inner.live_cursor = None;
            }
        }
        self.rows = Rows::Buffered(VecDeque::new());
        self.state = CursorState::Disposed;
        debug!(trx = self.trx.id(), cursor = self.id, "disposed cursor");
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Checks every collection the query touches against the transaction's
/// intents. Undeclared reads widen the read set when implicit access is
/// allowed and the intents are free right now; writes always need a
/// declared write intent.
fn resolve_access(db: &Database, state: &TrxState, inner: &mut TrxInner, plan: &Plan) -> Result<()> {
    for name in plan.writes() {
        db.store(name)?;
        let writable = inner.intents.get(name).map(|mode| mode.can_write()).unwrap_or(false);
        if !writable {
            return Err(Error::UnregisteredCollection {
                collection: name.clone(),
                access: AccessMode::Write.as_str().to_string(),
            });
        }
    }

    let mut implicit = BTreeMap::new();
    for name in plan.reads() {
        db.store(name)?;
        if inner.intents.contains_key(name) {
            continue;
        }
        if !state.options.allow_implicit {
            return Err(Error::UnregisteredCollection {
                collection: name.clone(),
                access: AccessMode::Read.as_str().to_string(),
            });
        }
        implicit.insert(name.clone(), AccessMode::Read);
    }

    if !implicit.is_empty() {
        // Never wait here: the transaction already holds intents.
        db.locks.try_acquire(state.id, &implicit).map_err(|err| {
            if matches!(err, Error::LockTimeout { .. }) {
                db.metrics.lock_timeout();
            }
            err
        })?;
        debug!(trx = state.id, collections = ?implicit.keys().collect::<Vec<_>>(), "widened read set");
        inner.intents.extend(implicit);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::options::{ServerOptions, TransactionOptions};
    use crate::core::server::Server;
    use serde_json::json;

    fn setup() -> Database {
        let server = Server::new(ServerOptions::default()).unwrap();
        let db = server.create_database("test").unwrap();
        let c = db.create_collection("c").unwrap();
        for i in 0..5 {
            c.insert(json!({"_key": format!("k{}", i), "n": i})).unwrap();
        }
        db
    }

    #[test]
    fn test_buffered_query_with_count() {
        let db = setup();
        let trx = db.begin(TransactionOptions::new().read(["c"])).unwrap();
        let options = QueryOptions { stream: false, count: true };
        let mut cursor = trx.query("FOR d IN c FILTER d.n >= 2 RETURN d.n", &Value::Null, options).unwrap();

        assert_eq!(cursor.count(), Some(3));
        assert_eq!(cursor.stats().scanned_full, 5);
        assert_eq!(cursor.stats().filtered, 2);
        assert_eq!(cursor.next_batch(2).unwrap(), vec![json!(2), json!(3)]);
        assert!(cursor.has_more());
        assert_eq!(cursor.collect_all().unwrap(), vec![json!(4)]);
        assert!(!cursor.has_more());
        assert_eq!(cursor.next().unwrap(), None);
    }

    #[test]
    fn test_single_live_cursor() {
        let db = setup();
        let trx = db.begin(TransactionOptions::new().read(["c"])).unwrap();
        let mut first = trx.query("FOR d IN c RETURN d", &Value::Null, QueryOptions::streaming()).unwrap();

        let err = trx.query("RETURN 1", &Value::Null, QueryOptions::default()).unwrap_err();
        assert_eq!(err.code(), 28);
        assert!(trx.is_running());

        first.dispose();
        assert_eq!(first.next().unwrap_err().code(), 1600);
        let mut second = trx.query("RETURN 1", &Value::Null, QueryOptions::default()).unwrap();
        assert_eq!(second.collect_all().unwrap(), vec![json!(1)]);
    }

    #[test]
    fn test_dropped_cursor_frees_slot() {
        let db = setup();
        let trx = db.begin(TransactionOptions::new().read(["c"])).unwrap();
        {
            let _cursor = trx.query("FOR d IN c RETURN d", &Value::Null, QueryOptions::streaming()).unwrap();
        }
        assert!(trx.query("RETURN 1", &Value::Null, QueryOptions::default()).is_ok());
    }

    #[test]
    fn test_commit_disposes_cursor() {
        let db = setup();
        let trx = db.begin(TransactionOptions::new().read(["c"])).unwrap();
        let mut cursor = trx.query("FOR d IN c RETURN d", &Value::Null, QueryOptions::streaming()).unwrap();
        assert!(cursor.next().unwrap().is_some());

        trx.commit().unwrap();
        assert_eq!(cursor.next().unwrap_err().code(), 1600);
    }

    #[test]
    fn test_streaming_writes_are_lazy() {
        let db = setup();
        let trx = db.begin(TransactionOptions::new().write(["c"])).unwrap();
        let mut cursor = trx
            .query("FOR d IN c REMOVE d IN c RETURN OLD._key", &Value::Null, QueryOptions::streaming())
            .unwrap();

        assert_eq!(cursor.next().unwrap(), Some(json!("k0")));
        assert_eq!(cursor.stats().writes_executed, 1);
        cursor.dispose();

        assert_eq!(trx.collection("c").unwrap().count().unwrap(), 4);
    }

    #[test]
    fn test_implicit_read_widens_intents() {
        let db = setup();
        db.create_collection("other").unwrap();
        let trx = db.begin(TransactionOptions::new()).unwrap();

        let mut cursor = trx.query("FOR d IN c RETURN d._key", &Value::Null, QueryOptions::default()).unwrap();
        assert_eq!(cursor.collect_all().unwrap().len(), 5);
        assert_eq!(trx.collections().get("c"), Some(&AccessMode::Read));

        let strict = db.begin(TransactionOptions::new().allow_implicit(false)).unwrap();
        let err = strict.query("FOR d IN other RETURN d", &Value::Null, QueryOptions::default()).unwrap_err();
        assert_eq!(err.code(), 1652);
    }

    #[test]
    fn test_undeclared_write_fails_before_rows() {
        let db = setup();
        let trx = db.begin(TransactionOptions::new().read(["c"])).unwrap();
        let err = trx
            .query("FOR i IN [1] INSERT {v: i} INTO c", &Value::Null, QueryOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), 1652);

        let err = trx
            .query("FOR d IN missing RETURN d", &Value::Null, QueryOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), 1203);
    }
}
