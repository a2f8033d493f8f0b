//! Atomic blocks with isolation levels and retries.
//!
//! [`atomic()`] returns an [`Atomic`] configuration that is used one of two
//! ways:
//!
//! - as a scoped block with [`Atomic::enter`], which returns an
//!   [`AtomicBlock`] guard that commits or rolls back when it is finished;
//! - around a unit of work with [`Atomic::run`] or [`Atomic::wrap`], which may
//!   re-run the work in a fresh transaction when the database reports a
//!   serialization failure or deadlock.
//!
//! The isolation level is fixed by the outermost transaction. Nested blocks
//! inherit it, and may only restate it (or set it before the parent has run
//! any query). Retries always restart the outermost transaction, so they are
//! refused for nested blocks and for scoped blocks, whose bodies can't be
//! replayed.
//!
//! # Usage
//!
//! ```ignore
//! use pgatomic::{atomic, Connections, SERIALIZABLE};
//!
//! let mut connections = Connections::with_default(db.connect());
//!
//! // Scoped block
//! let mut block = atomic().isolation_level(SERIALIZABLE).enter(&mut connections)?;
//! block.connection()?.insert("trades", "t1", json!({"price": 1}))?;
//! block.commit()?;
//!
//! // Retried unit of work
//! atomic().isolation_level(SERIALIZABLE).retry(3).run(&mut connections, |conns| {
//!     let conn = conns.default_connection()?;
//!     let trade = conn.get("trades", "t1")?;
//!     conn.update("trades", "t1", reprice(trade))?;
//!     Ok::<_, pgatomic::Error>(())
//! })?;
//! ```

mod block;
mod retry;

use crate::connection::{Connection, Session, DEFAULT_DB_ALIAS, POSTGRESQL_VENDOR};
use crate::error::{Error, Result, SqlState};
use crate::isolation::IsolationLevel;

pub use block::AtomicBlock;
pub use retry::AtomicFn;

/// Start configuring an atomic block on the default database.
pub fn atomic() -> Atomic {
    Atomic::new()
}

/// Configuration of an atomic block.
///
/// An `Atomic` is a template: every [`enter`](Atomic::enter) and every
/// attempt of [`run`](Atomic::run) opens a fresh block from it. It holds no
/// per-invocation state, so it can be shared freely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atomic {
    using: String,
    savepoint: bool,
    durable: bool,
    isolation_level: Option<IsolationLevel>,
    retry: Option<u32>,
    retry_on: Option<Vec<SqlState>>,
}

impl Default for Atomic {
    fn default() -> Self {
        Self {
            using: DEFAULT_DB_ALIAS.to_string(),
            savepoint: true,
            durable: false,
            isolation_level: None,
            retry: None,
            retry_on: None,
        }
    }
}

impl Atomic {
    pub fn new() -> Self {
        Self::default()
    }

    /// Database alias to open the block on.
    pub fn using(mut self, alias: impl Into<String>) -> Self {
        self.using = alias.into();
        self
    }

    /// Whether a nested block creates a savepoint (default `true`).
    pub fn savepoint(mut self, savepoint: bool) -> Self {
        self.savepoint = savepoint;
        self
    }

    /// Refuse to open inside another atomic block.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Isolation level of the transaction. Unset inherits the current one.
    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    /// Number of times the work is re-run after a retryable failure.
    ///
    /// Only valid for [`run`](Atomic::run) and [`wrap`](Atomic::wrap) on an
    /// outermost block. Unset uses the process-wide default, so with a
    /// non-zero default, scoped and nested blocks need `retry(0)`.
    pub fn retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Database errors that trigger a retry, instead of the process-wide set.
    pub fn retry_on(mut self, states: impl IntoIterator<Item = SqlState>) -> Self {
        self.retry_on = Some(states.into_iter().collect());
        self
    }

    pub fn alias(&self) -> &str {
        &self.using
    }

    pub fn get_isolation_level(&self) -> Option<IsolationLevel> {
        self.isolation_level
    }

    pub fn get_retry(&self) -> Option<u32> {
        self.retry
    }

    /// Checks that only depend on the target connection, run before any I/O.
    fn validate<C: Connection>(&self, session: &Session<C>) -> Result<()> {
        if let Some(level) = self.isolation_level {
            if session.vendor() != POSTGRESQL_VENDOR {
                return Err(Error::Unsupported(format!(
                    "isolation level {level} cannot be set on {} connections",
                    session.vendor()
                )));
            }
        }
        Ok(())
    }
}
