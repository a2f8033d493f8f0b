//! Atomic-block state of a single connection.
//!
//! The outermost atomic block owns the transaction; nested blocks are
//! savepoints inside it. A nested block entered without a savepoint (or
//! while the transaction is already doomed) can't undo its own work, so its
//! failure marks the whole transaction for rollback instead.

use tracing::{debug, warn};
use ulid::Ulid;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::isolation::IsolationLevel;

type OnCommitHook = Box<dyn FnOnce() + Send + 'static>;

/// Ties an atomic block to the nesting level it opened.
///
/// Returned by [`Session::begin_atomic`] and consumed when the block exits.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an atomic block must be exited with commit_atomic or rollback_atomic"]
pub struct AtomicHandle {
    /// 0 for the outermost block.
    depth: usize,
    savepoint: Option<String>,
}

impl AtomicHandle {
    pub fn is_outermost(&self) -> bool {
        self.depth == 0
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Savepoint created for this block, if any.
    pub fn savepoint(&self) -> Option<&str> {
        self.savepoint.as_deref()
    }
}

/// How an atomic block ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Committed (outermost) or savepoint released (nested).
    Committed,
    /// Work was undone, or the enclosing transaction was marked for rollback.
    RolledBack,
}

/// One connection plus the atomic blocks open on it.
pub struct Session<C> {
    alias: String,
    conn: C,
    in_atomic_block: bool,
    /// One entry per open nested block; `None` when no savepoint was created.
    savepoint_ids: Vec<Option<String>>,
    needs_rollback: bool,
    /// Hooks and the savepoints that were open when each was registered.
    run_on_commit: Vec<(Vec<String>, OnCommitHook)>,
}

impl<C: Connection> Session<C> {
    pub fn new(alias: impl Into<String>, conn: C) -> Self {
        Self {
            alias: alias.into(),
            conn,
            in_atomic_block: false,
            savepoint_ids: Vec::new(),
            needs_rollback: false,
            run_on_commit: Vec::new(),
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn vendor(&self) -> &str {
        self.conn.vendor()
    }

    /// Check if a transaction opened by an atomic block is in progress.
    pub fn in_atomic_block(&self) -> bool {
        self.in_atomic_block
    }

    /// Number of open atomic blocks.
    pub fn depth(&self) -> usize {
        if self.in_atomic_block {
            self.savepoint_ids.len() + 1
        } else {
            0
        }
    }

    /// Get the connection for queries.
    pub fn connection(&mut self) -> Result<&mut C> {
        if self.in_atomic_block && self.needs_rollback {
            return Err(Error::TransactionManagement(
                "an error occurred in the current transaction; \
                 queries are refused until the end of the atomic block"
                    .to_string(),
            ));
        }
        Ok(&mut self.conn)
    }

    /// Borrow the connection without the rollback check.
    pub fn get_ref(&self) -> &C {
        &self.conn
    }

    pub fn into_inner(self) -> C {
        self.conn
    }

    /// Effective isolation level of the current transaction.
    pub fn isolation_level(&mut self) -> Result<IsolationLevel> {
        self.conn.isolation_level()
    }

    /// Issue `SET TRANSACTION ISOLATION LEVEL` on the connection.
    pub fn set_isolation_level(&mut self, level: IsolationLevel) -> Result<()> {
        debug!(alias = %self.alias, %level, "setting isolation level");
        self.conn.execute(&level.set_transaction_sql())
    }

    /// Force (or cancel) a rollback when the innermost atomic block exits.
    pub fn set_rollback(&mut self, rollback: bool) -> Result<()> {
        if !self.in_atomic_block {
            return Err(Error::TransactionManagement(
                "the rollback flag doesn't work outside of an atomic block".to_string(),
            ));
        }
        self.needs_rollback = rollback;
        Ok(())
    }

    pub fn get_rollback(&self) -> Result<bool> {
        if !self.in_atomic_block {
            return Err(Error::TransactionManagement(
                "the rollback flag doesn't work outside of an atomic block".to_string(),
            ));
        }
        Ok(self.needs_rollback)
    }

    /// Run `hook` after the outermost transaction commits.
    ///
    /// Outside an atomic block the hook runs immediately. Hooks registered
    /// inside a savepoint that is rolled back are discarded.
    pub fn on_commit<F>(&mut self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.in_atomic_block {
            hook();
            return;
        }
        let open: Vec<String> = self.savepoint_ids.iter().flatten().cloned().collect();
        self.run_on_commit.push((open, Box::new(hook)));
    }

    /// Open an atomic block: a transaction if none is open, otherwise a savepoint.
    pub fn begin_atomic(&mut self, savepoint: bool, durable: bool) -> Result<AtomicHandle> {
        if durable && self.in_atomic_block {
            return Err(Error::TransactionManagement(
                "a durable atomic block cannot be nested within another atomic block".to_string(),
            ));
        }

        if !self.in_atomic_block {
            self.needs_rollback = false;
            self.conn.begin()?;
            self.in_atomic_block = true;
            debug!(alias = %self.alias, "began transaction");
            return Ok(AtomicHandle {
                depth: 0,
                savepoint: None,
            });
        }

        let sid = if savepoint && !self.needs_rollback {
            let sid = new_savepoint_id();
            self.conn.execute(&format!("SAVEPOINT {sid}"))?;
            debug!(alias = %self.alias, savepoint = %sid, "created savepoint");
            Some(sid)
        } else {
            None
        };
        self.savepoint_ids.push(sid.clone());

        Ok(AtomicHandle {
            depth: self.savepoint_ids.len(),
            savepoint: sid,
        })
    }

    /// Leave an atomic block whose work succeeded.
    ///
    /// Commits the outermost block or releases the savepoint of a nested one.
    /// A block marked for rollback is rolled back instead.
    pub fn commit_atomic(&mut self, handle: AtomicHandle) -> Result<Exit> {
        self.check_exit_order(&handle)?;

        if self.needs_rollback {
            debug!(alias = %self.alias, depth = handle.depth, "marked for rollback");
            self.rollback_atomic(handle)?;
            return Ok(Exit::RolledBack);
        }

        if handle.is_outermost() {
            self.in_atomic_block = false;
            if let Err(err) = self.conn.commit() {
                if let Err(rollback_err) = self.conn.rollback() {
                    warn!(alias = %self.alias, "rollback after failed commit failed: {}", rollback_err);
                }
                self.run_on_commit.clear();
                return Err(err);
            }
            debug!(alias = %self.alias, "committed transaction");
            for (_, hook) in std::mem::take(&mut self.run_on_commit) {
                hook();
            }
            return Ok(Exit::Committed);
        }

        self.savepoint_ids.pop();
        if let Some(sid) = handle.savepoint {
            if let Err(err) = self.conn.execute(&format!("RELEASE SAVEPOINT {sid}")) {
                if self.rollback_to_savepoint(&sid).is_err() {
                    self.needs_rollback = true;
                }
                return Err(err);
            }
            debug!(alias = %self.alias, savepoint = %sid, "released savepoint");
        }
        Ok(Exit::Committed)
    }

    /// Leave an atomic block whose work failed.
    ///
    /// Rolls back the transaction (outermost), rolls back to the savepoint
    /// (nested), or marks the transaction for rollback (nested without a
    /// savepoint).
    pub fn rollback_atomic(&mut self, handle: AtomicHandle) -> Result<()> {
        self.check_exit_order(&handle)?;
        self.needs_rollback = false;

        if handle.is_outermost() {
            self.in_atomic_block = false;
            self.run_on_commit.clear();
            self.conn.rollback()?;
            debug!(alias = %self.alias, "rolled back transaction");
            return Ok(());
        }

        self.savepoint_ids.pop();
        match handle.savepoint {
            None => {
                self.needs_rollback = true;
                Ok(())
            }
            Some(sid) => self.rollback_to_savepoint(&sid).inspect_err(|_| {
                self.needs_rollback = true;
            }),
        }
    }

    fn rollback_to_savepoint(&mut self, sid: &str) -> Result<()> {
        self.conn.execute(&format!("ROLLBACK TO SAVEPOINT {sid}"))?;
        self.conn.execute(&format!("RELEASE SAVEPOINT {sid}"))?;
        self.run_on_commit
            .retain(|(savepoints, _)| !savepoints.iter().any(|open| open == sid));
        debug!(alias = %self.alias, savepoint = %sid, "rolled back to savepoint");
        Ok(())
    }

    fn check_exit_order(&self, handle: &AtomicHandle) -> Result<()> {
        let expected = if self.in_atomic_block {
            self.savepoint_ids.len()
        } else {
            usize::MAX
        };
        if handle.depth != expected {
            return Err(Error::TransactionManagement(format!(
                "atomic blocks must exit in reverse order of entry \
                 (exiting depth {}, innermost open depth {})",
                handle.depth,
                self.depth().saturating_sub(1)
            )));
        }
        Ok(())
    }
}

impl<C> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("alias", &self.alias)
            .field("in_atomic_block", &self.in_atomic_block)
            .field("savepoint_ids", &self.savepoint_ids)
            .field("needs_rollback", &self.needs_rollback)
            .field("on_commit_hooks", &self.run_on_commit.len())
            .finish()
    }
}

fn new_savepoint_id() -> String {
    format!("s_{}", Ulid::new().to_string().to_lowercase())
}
