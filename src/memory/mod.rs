//! In-process database with PostgreSQL transaction semantics.
//!
//! Rows are JSON documents addressed by table and key. Transactions follow
//! PostgreSQL's rules closely enough to exercise atomic blocks without a
//! server:
//!
//! - outside a transaction every statement commits on its own
//! - `READ COMMITTED` statements read the latest committed data;
//!   `REPEATABLE READ` and `SERIALIZABLE` read the snapshot taken by the
//!   transaction's first data statement
//! - under snapshot levels, writing a row committed by someone else after the
//!   snapshot fails with `40001`; at commit the first committer wins, and
//!   `SERIALIZABLE` also fails writers whose reads went stale
//! - a failed statement aborts the transaction until `ROLLBACK` or
//!   `ROLLBACK TO SAVEPOINT`
//! - the isolation level can only change before the first query and outside
//!   savepoints
//!
//! Predicate locks are not modelled: inserting a row that a concurrent
//! serializable transaction scanned for is not a conflict.

mod statement;
mod store;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use tracing::{debug, warn};

use crate::connection::{Connection, POSTGRESQL_VENDOR};
use crate::error::{DatabaseError, Error, Result, SqlState};
use crate::isolation::IsolationLevel;

use self::statement::ControlStatement;
use self::store::{RowId, Store, WriteSet};

/// Shared in-memory database. Cheap to clone; clones share data.
#[derive(Clone)]
pub struct MemoryDatabase {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    vendor: String,
    store: Mutex<Store>,
    next_connection: AtomicU64,
}

impl MemoryDatabase {
    /// Create an empty PostgreSQL-flavoured database.
    pub fn new() -> Self {
        Self::with_vendor(POSTGRESQL_VENDOR)
    }

    /// Create an empty database reporting another vendor.
    pub fn with_vendor(vendor: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                vendor: vendor.into(),
                store: Mutex::new(Store::default()),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    pub fn vendor(&self) -> &str {
        &self.inner.vendor
    }

    /// Open a new connection. Each thread should use its own.
    pub fn connect(&self) -> MemoryConnection {
        let id = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        MemoryConnection {
            id,
            db: self.clone(),
            tx: None,
            executed: Vec::new(),
        }
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.inner.store.lock()
    }

    /// Latest committed value of a row.
    pub fn get(&self, table: &str, key: &str) -> Option<Value> {
        self.store().latest(&row_id(table, key)).cloned()
    }

    /// Committed rows of a table, ordered by key.
    pub fn scan(&self, table: &str) -> BTreeMap<String, Value> {
        let store = self.store();
        store.scan(table, store.now())
    }

    /// Number of committed rows in a table.
    pub fn count(&self, table: &str) -> usize {
        self.scan(table).len()
    }

    /// Write a row in its own commit, replacing any previous value.
    pub fn insert_committed(&self, table: &str, key: &str, value: Value) {
        self.store()
            .apply(WriteSet::from([(row_id(table, key), Some(value))]));
    }

    /// Number of commits that changed data.
    pub fn commit_count(&self) -> u64 {
        self.store().now()
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("vendor", &self.inner.vendor)
            .field("commits", &self.commit_count())
            .finish()
    }
}

/// Savepoint: the transaction state to restore on `ROLLBACK TO SAVEPOINT`.
#[derive(Debug, Clone)]
struct SavepointFrame {
    name: String,
    writes: WriteSet,
    reads: BTreeSet<RowId>,
}

#[derive(Debug)]
struct TxState {
    isolation: IsolationLevel,
    /// Taken by the first data statement.
    snapshot: Option<u64>,
    writes: WriteSet,
    /// Rows read; only tracked under SERIALIZABLE.
    reads: BTreeSet<RowId>,
    savepoints: Vec<SavepointFrame>,
    aborted: bool,
    started_at: DateTime<Utc>,
}

impl TxState {
    fn new() -> Self {
        Self {
            isolation: IsolationLevel::default(),
            snapshot: None,
            writes: WriteSet::new(),
            reads: BTreeSet::new(),
            savepoints: Vec::new(),
            aborted: false,
            started_at: Utc::now(),
        }
    }

    /// Commit point reads should see, taking the snapshot if needed.
    fn read_point(&mut self, store: &Store) -> u64 {
        let snapshot = *self.snapshot.get_or_insert_with(|| store.now());
        if self.isolation.uses_snapshot() {
            snapshot
        } else {
            store.now()
        }
    }

    fn record_read(&mut self, id: &RowId) {
        if self.isolation == IsolationLevel::Serializable {
            self.reads.insert(id.clone());
        }
    }

    fn visible(&mut self, store: &Store, id: &RowId) -> Option<Value> {
        let at = self.read_point(store);
        self.record_read(id);
        match self.writes.get(id) {
            Some(own) => own.clone(),
            None => store.read(id, at).cloned(),
        }
    }

    /// Fail a write to a row that changed after our snapshot.
    fn check_concurrent_update(&self, store: &Store, id: &RowId) -> Result<()> {
        if !self.isolation.uses_snapshot() || self.writes.contains_key(id) {
            return Ok(());
        }
        match self.snapshot {
            Some(snapshot) if store.modified_since(id, snapshot) => {
                Err(DatabaseError::serialization_failure("concurrent update").into())
            }
            _ => Ok(()),
        }
    }

    /// First-committer-wins validation run while holding the store lock.
    fn validate_commit(&self, store: &Store) -> Result<()> {
        let Some(snapshot) = self.snapshot else {
            return Ok(());
        };
        if !self.isolation.uses_snapshot() || self.writes.is_empty() {
            return Ok(());
        }
        if self.writes.keys().any(|id| store.modified_since(id, snapshot)) {
            return Err(DatabaseError::serialization_failure("concurrent update").into());
        }
        if self.isolation == IsolationLevel::Serializable
            && self.reads.iter().any(|id| store.modified_since(id, snapshot))
        {
            return Err(DatabaseError::serialization_failure(
                "read/write dependencies among transactions",
            )
            .into());
        }
        Ok(())
    }

    fn find_savepoint(&self, name: &str) -> Result<usize> {
        self.savepoints
            .iter()
            .rposition(|frame| frame.name == name)
            .ok_or_else(|| {
                DatabaseError::new(
                    SqlState::INVALID_SAVEPOINT_SPECIFICATION,
                    format!("savepoint \"{name}\" does not exist"),
                )
                .into()
            })
    }
}

/// A connection to a [`MemoryDatabase`].
pub struct MemoryConnection {
    id: u64,
    db: MemoryDatabase,
    tx: Option<TxState>,
    executed: Vec<String>,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn database(&self) -> &MemoryDatabase {
        &self.db
    }

    /// Check if a transaction is open on this connection.
    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// Statements issued on this connection, oldest first.
    pub fn executed(&self) -> &[String] {
        &self.executed
    }

    pub fn clear_executed(&mut self) {
        self.executed.clear();
    }

    /// Read a row.
    pub fn get(&mut self, table: &str, key: &str) -> Result<Option<Value>> {
        let id = row_id(table, key);
        self.data_statement(format!("SELECT {table}/{key}"), |tx, store| {
            Ok(tx.visible(store, &id))
        })
    }

    /// Read every row of a table, ordered by key.
    pub fn scan(&mut self, table: &str) -> Result<BTreeMap<String, Value>> {
        self.data_statement(format!("SELECT {table}/*"), |tx, store| {
            let at = tx.read_point(store);
            let mut rows = store.scan(table, at);
            for key in store.keys(table) {
                tx.record_read(&row_id(table, &key));
            }
            for ((write_table, key), value) in &tx.writes {
                if write_table != table {
                    continue;
                }
                match value {
                    Some(value) => rows.insert(key.clone(), value.clone()),
                    None => rows.remove(key),
                };
            }
            Ok(rows)
        })
    }

    /// Insert a new row; fails with `23505` if the key exists.
    pub fn insert(&mut self, table: &str, key: &str, value: Value) -> Result<()> {
        let id = row_id(table, key);
        self.data_statement(format!("INSERT {table}/{key}"), |tx, store| {
            tx.read_point(store);
            let exists = match tx.writes.get(&id) {
                Some(own) => own.is_some(),
                None => store.latest(&id).is_some(),
            };
            if exists {
                return Err(DatabaseError::new(
                    SqlState::UNIQUE_VIOLATION,
                    format!("duplicate key value violates unique constraint \"{table}_pkey\""),
                )
                .into());
            }
            tx.writes.insert(id, Some(value));
            Ok(())
        })
    }

    /// Replace an existing row. Returns `false` if no visible row matched.
    pub fn update(&mut self, table: &str, key: &str, value: Value) -> Result<bool> {
        let id = row_id(table, key);
        self.data_statement(format!("UPDATE {table}/{key}"), |tx, store| {
            if tx.visible(store, &id).is_none() {
                return Ok(false);
            }
            tx.check_concurrent_update(store, &id)?;
            tx.writes.insert(id, Some(value));
            Ok(true)
        })
    }

    /// Delete a row. Returns `false` if no visible row matched.
    pub fn delete(&mut self, table: &str, key: &str) -> Result<bool> {
        let id = row_id(table, key);
        self.data_statement(format!("DELETE {table}/{key}"), |tx, store| {
            if tx.visible(store, &id).is_none() {
                return Ok(false);
            }
            tx.check_concurrent_update(store, &id)?;
            tx.writes.insert(id, None);
            Ok(true)
        })
    }

    /// Run a data statement in the open transaction, or in its own one.
    fn data_statement<T>(
        &mut self,
        label: String,
        op: impl FnOnce(&mut TxState, &Store) -> Result<T>,
    ) -> Result<T> {
        self.executed.push(label);

        let Some(tx) = self.tx.as_mut() else {
            let mut tx = TxState::new();
            let mut store = self.db.store();
            let value = op(&mut tx, &*store)?;
            store.apply(tx.writes);
            return Ok(value);
        };

        if tx.aborted {
            return Err(in_failed_transaction());
        }
        let store = self.db.store();
        let result = op(tx, &*store);
        if result.is_err() {
            tx.aborted = true;
        }
        result
    }

    fn control_statement(&mut self, statement: ControlStatement) -> Result<()> {
        match statement {
            ControlStatement::Begin => self.begin_transaction(),
            ControlStatement::Commit => self.commit_transaction(),
            ControlStatement::Rollback => self.rollback_transaction(),
            ControlStatement::Savepoint(name) => self.in_transaction_block("SAVEPOINT", |tx| {
                tx.savepoints.push(SavepointFrame {
                    name,
                    writes: tx.writes.clone(),
                    reads: tx.reads.clone(),
                });
                Ok(())
            }),
            ControlStatement::ReleaseSavepoint(name) => {
                self.in_transaction_block("RELEASE SAVEPOINT", |tx| {
                    let index = tx.find_savepoint(&name)?;
                    tx.savepoints.truncate(index);
                    Ok(())
                })
            }
            ControlStatement::RollbackToSavepoint(name) => {
                let Some(tx) = self.tx.as_mut() else {
                    return Err(no_transaction("ROLLBACK TO SAVEPOINT"));
                };
                let index = tx.find_savepoint(&name).inspect_err(|_| tx.aborted = true)?;
                let frame = &tx.savepoints[index];
                tx.writes = frame.writes.clone();
                tx.reads = frame.reads.clone();
                tx.savepoints.truncate(index + 1);
                tx.aborted = false;
                Ok(())
            }
            ControlStatement::SetIsolationLevel(level) => {
                if self.tx.is_none() {
                    warn!(connection = self.id, "SET TRANSACTION can only be used in transaction blocks");
                    return Ok(());
                }
                self.in_transaction_block("SET TRANSACTION", |tx| {
                    if level == tx.isolation {
                        return Ok(());
                    }
                    if tx.snapshot.is_some() {
                        return Err(DatabaseError::new(
                            SqlState::ACTIVE_SQL_TRANSACTION,
                            "SET TRANSACTION ISOLATION LEVEL must be called before any query",
                        )
                        .into());
                    }
                    if !tx.savepoints.is_empty() {
                        return Err(DatabaseError::new(
                            SqlState::ACTIVE_SQL_TRANSACTION,
                            "SET TRANSACTION ISOLATION LEVEL must not be called in a subtransaction",
                        )
                        .into());
                    }
                    tx.isolation = level;
                    Ok(())
                })
            }
        }
    }

    /// Run a statement that needs a healthy open transaction; failures abort it.
    fn in_transaction_block(
        &mut self,
        command: &str,
        op: impl FnOnce(&mut TxState) -> Result<()>,
    ) -> Result<()> {
        let Some(tx) = self.tx.as_mut() else {
            return Err(no_transaction(command));
        };
        if tx.aborted {
            return Err(in_failed_transaction());
        }
        let result = op(tx);
        if result.is_err() {
            tx.aborted = true;
        }
        result
    }

    fn begin_transaction(&mut self) -> Result<()> {
        if self.tx.is_some() {
            warn!(connection = self.id, "there is already a transaction in progress");
            return Ok(());
        }
        self.tx = Some(TxState::new());
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<()> {
        let Some(tx) = self.tx.take() else {
            warn!(connection = self.id, "there is no transaction in progress");
            return Ok(());
        };
        if tx.aborted {
            return Err(DatabaseError::new(
                SqlState::IN_FAILED_SQL_TRANSACTION,
                "current transaction is aborted; commit was rolled back",
            )
            .into());
        }

        let mut store = self.db.store();
        tx.validate_commit(&store)?;
        let writes = tx.writes.len();
        let committed_at = store.apply(tx.writes);
        debug!(
            connection = self.id,
            isolation = %tx.isolation,
            writes,
            committed_at,
            elapsed_ms = (Utc::now() - tx.started_at).num_milliseconds(),
            "transaction committed"
        );
        Ok(())
    }

    fn rollback_transaction(&mut self) -> Result<()> {
        if self.tx.take().is_none() {
            warn!(connection = self.id, "there is no transaction in progress");
        }
        Ok(())
    }
}

impl Connection for MemoryConnection {
    fn vendor(&self) -> &str {
        self.db.vendor()
    }

    fn begin(&mut self) -> Result<()> {
        self.execute("BEGIN")
    }

    fn commit(&mut self) -> Result<()> {
        self.execute("COMMIT")
    }

    fn rollback(&mut self) -> Result<()> {
        self.execute("ROLLBACK")
    }

    fn execute(&mut self, sql: &str) -> Result<()> {
        self.executed.push(sql.to_string());
        let statement = match ControlStatement::parse(sql) {
            Ok(statement) => statement,
            Err(err) => {
                if let Some(tx) = self.tx.as_mut() {
                    tx.aborted = true;
                }
                return Err(err.into());
            }
        };
        self.control_statement(statement)
    }

    fn isolation_level(&mut self) -> Result<IsolationLevel> {
        Ok(self
            .tx
            .as_ref()
            .map(|tx| tx.isolation)
            .unwrap_or_default())
    }
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .field("in_transaction", &self.tx.is_some())
            .finish()
    }
}

fn row_id(table: &str, key: &str) -> RowId {
    (table.to_string(), key.to_string())
}

fn no_transaction(command: &str) -> Error {
    DatabaseError::new(
        SqlState::NO_ACTIVE_SQL_TRANSACTION,
        format!("{command} can only be used in transaction blocks"),
    )
    .into()
}

fn in_failed_transaction() -> Error {
    DatabaseError::new(
        SqlState::IN_FAILED_SQL_TRANSACTION,
        "current transaction is aborted, commands ignored until end of transaction block",
    )
    .into()
}
