//! Database connections and their transaction state.
//!
//! A [`Connection`] is the raw driver: it can begin, commit and roll back a
//! transaction and execute control statements. A [`Session`] wraps one
//! connection and tracks atomic-block nesting on top of it. [`Connections`]
//! maps database aliases to sessions; each thread owns its own registry.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Connections  (alias -> Session, per thread)  │
//! └──────────────────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌──────────────────────────────────────────────┐
//! │ Session  (in_atomic_block, savepoints,       │
//! │           needs_rollback, on_commit hooks)   │
//! └──────────────────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌──────────────────────────────────────────────┐
//! │ Connection  (BEGIN / COMMIT / ROLLBACK / SQL)│
//! └──────────────────────────────────────────────┘
//! ```

mod session;

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::isolation::IsolationLevel;

pub use session::{AtomicHandle, Exit, Session};

/// Alias used when an atomic block doesn't name a database.
pub const DEFAULT_DB_ALIAS: &str = "default";

/// Vendor string of PostgreSQL-family connections.
pub const POSTGRESQL_VENDOR: &str = "postgresql";

/// Transaction primitives of a database driver.
///
/// Implementations are not expected to track nesting; [`Session`] issues
/// `SAVEPOINT`, `RELEASE SAVEPOINT` and `ROLLBACK TO SAVEPOINT` through
/// [`Connection::execute`] for nested blocks.
pub trait Connection {
    /// Database family, e.g. `postgresql`.
    fn vendor(&self) -> &str;

    /// Start a transaction.
    fn begin(&mut self) -> Result<()>;

    /// Commit the current transaction.
    fn commit(&mut self) -> Result<()>;

    /// Roll back the current transaction.
    fn rollback(&mut self) -> Result<()>;

    /// Execute a statement that returns no rows.
    fn execute(&mut self, sql: &str) -> Result<()>;

    /// Isolation level in effect for the current (or next) transaction.
    fn isolation_level(&mut self) -> Result<IsolationLevel>;
}

/// Registry of sessions keyed by database alias.
pub struct Connections<C> {
    sessions: HashMap<String, Session<C>>,
}

impl<C: Connection> Connections<C> {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    /// A registry holding a single connection under [`DEFAULT_DB_ALIAS`].
    pub fn with_default(conn: C) -> Self {
        let mut connections = Self::new();
        connections.register(DEFAULT_DB_ALIAS, conn);
        connections
    }

    /// Register a connection, returning the session it replaces.
    pub fn register(&mut self, alias: impl Into<String>, conn: C) -> Option<Session<C>> {
        let alias = alias.into();
        tracing::debug!("registering connection {:?}", alias);
        self.sessions
            .insert(alias.clone(), Session::new(alias, conn))
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, alias: &str) -> Option<Session<C>> {
        self.sessions.remove(alias)
    }

    pub fn session(&self, alias: &str) -> Result<&Session<C>> {
        self.sessions
            .get(alias)
            .ok_or_else(|| Error::ConnectionDoesNotExist(alias.to_string()))
    }

    pub fn session_mut(&mut self, alias: &str) -> Result<&mut Session<C>> {
        self.sessions
            .get_mut(alias)
            .ok_or_else(|| Error::ConnectionDoesNotExist(alias.to_string()))
    }

    /// Get the connection for queries.
    ///
    /// Fails while the current transaction is marked for rollback.
    pub fn connection(&mut self, alias: &str) -> Result<&mut C> {
        self.session_mut(alias)?.connection()
    }

    /// Get the default connection for queries.
    pub fn default_connection(&mut self) -> Result<&mut C> {
        self.connection(DEFAULT_DB_ALIAS)
    }

    /// List all registered aliases.
    pub fn aliases(&self) -> Vec<&str> {
        self.sessions.keys().map(String::as_str).collect()
    }

    /// Check if the connection is inside an atomic block.
    pub fn in_atomic_block(&self, alias: &str) -> Result<bool> {
        Ok(self.session(alias)?.in_atomic_block())
    }

    /// Run `hook` once the current transaction on `alias` commits.
    pub fn on_commit<F>(&mut self, alias: &str, hook: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.session_mut(alias)?.on_commit(hook);
        Ok(())
    }

    /// Force (or cancel) a rollback when the innermost atomic block on `alias` exits.
    pub fn set_rollback(&mut self, alias: &str, rollback: bool) -> Result<()> {
        self.session_mut(alias)?.set_rollback(rollback)
    }

    /// Check if the innermost atomic block on `alias` will roll back.
    pub fn get_rollback(&self, alias: &str) -> Result<bool> {
        self.session(alias)?.get_rollback()
    }
}

impl<C: Connection> Default for Connections<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> std::fmt::Debug for Connections<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connections")
            .field("aliases", &self.sessions.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDatabase;

    #[test]
    fn test_registry_lookup() {
        let db = MemoryDatabase::new();
        let mut connections = Connections::with_default(db.connect());
        connections.register("replica", db.connect());

        let mut aliases = connections.aliases();
        aliases.sort_unstable();
        assert_eq!(aliases, vec!["default", "replica"]);

        assert!(connections.default_connection().is_ok());
        assert!(!connections.in_atomic_block("replica").unwrap());

        let err = connections.connection("missing").unwrap_err();
        assert!(matches!(err, Error::ConnectionDoesNotExist(alias) if alias == "missing"));

        assert!(connections.remove("replica").is_some());
        assert!(connections.session("replica").is_err());
    }

    #[test]
    fn test_set_rollback_outside_atomic_block() {
        let db = MemoryDatabase::new();
        let mut connections = Connections::with_default(db.connect());

        let err = connections.set_rollback(DEFAULT_DB_ALIAS, true).unwrap_err();
        assert!(matches!(err, Error::TransactionManagement(_)));
        assert!(connections.get_rollback(DEFAULT_DB_ALIAS).is_err());
    }
}
