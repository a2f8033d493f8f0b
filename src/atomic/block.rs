//! Scoped atomic blocks.

use tracing::{error, warn};

use super::Atomic;
use crate::config;
use crate::connection::{AtomicHandle, Connection, Connections, Exit, Session};
use crate::error::{Error, Result, SqlState};
use crate::isolation::IsolationLevel;

/// How a block is being opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Invocation {
    /// `enter`: the body can't be replayed.
    Block,
    /// One attempt of `run`.
    Callable,
}

impl Atomic {
    /// Open a scoped atomic block.
    ///
    /// The returned guard must be finished with [`AtomicBlock::commit`],
    /// [`AtomicBlock::rollback`] or [`AtomicBlock::finish`]. Dropping it rolls
    /// the block back.
    ///
    /// A non-zero retry budget, explicit or from the process-wide settings,
    /// is rejected: retrying needs the work as a callable, see
    /// [`Atomic::run`].
    pub fn enter<'a, C: Connection>(
        &self,
        connections: &'a mut Connections<C>,
    ) -> Result<AtomicBlock<'a, C>> {
        let retry = self.retry.unwrap_or_else(|| config::settings().retry);
        self.open(connections, Invocation::Block, retry)
    }

    pub(super) fn open<'a, C: Connection>(
        &self,
        connections: &'a mut Connections<C>,
        invocation: Invocation,
        retry: u32,
    ) -> Result<AtomicBlock<'a, C>> {
        let session = connections.session_mut(&self.using)?;
        self.validate(session)?;

        let nested = session.in_atomic_block();
        if retry > 0 {
            if nested {
                return Err(Error::Configuration(
                    "retries are not permitted within a nested atomic block".to_string(),
                ));
            }
            if invocation == Invocation::Block {
                return Err(Error::Configuration(
                    "an atomic block with retries must wrap a callable; use run or wrap"
                        .to_string(),
                ));
            }
        }

        // A nested level must be in place before the savepoint: PostgreSQL
        // refuses SET TRANSACTION inside a subtransaction.
        if nested {
            if let Some(level) = self.isolation_level {
                set_inherited_level(session, level)?;
            }
        }

        let handle = session.begin_atomic(self.savepoint, self.durable)?;

        if !nested {
            if let Some(level) = self.isolation_level {
                if let Err(err) = session.set_isolation_level(level) {
                    if let Err(rollback_err) = session.rollback_atomic(handle) {
                        warn!(alias = %self.using, "rollback after failed SET TRANSACTION failed: {}", rollback_err);
                    }
                    return Err(err);
                }
            }
        }

        Ok(AtomicBlock {
            connections,
            alias: self.using.clone(),
            handle: Some(handle),
        })
    }
}

fn set_inherited_level<C: Connection>(
    session: &mut Session<C>,
    level: IsolationLevel,
) -> Result<()> {
    match session.set_isolation_level(level) {
        Err(Error::Database(source)) if source.code() == &SqlState::ACTIVE_SQL_TRANSACTION => {
            // The refused statement aborted the enclosing transaction.
            session.set_rollback(true)?;
            Err(Error::IsolationInherited {
                requested: level,
                source,
            })
        }
        other => other,
    }
}

/// An open atomic block.
///
/// Holds the connection registry for as long as the block is open, so work
/// inside the block goes through [`AtomicBlock::connections`] or
/// [`AtomicBlock::connection`]. Nested blocks are entered on the registry the
/// same way as outermost ones.
pub struct AtomicBlock<'a, C: Connection> {
    connections: &'a mut Connections<C>,
    alias: String,
    handle: Option<AtomicHandle>,
}

impl<C: Connection> AtomicBlock<'_, C> {
    /// The registry, for queries and nested blocks on any alias.
    pub fn connections(&mut self) -> &mut Connections<C> {
        self.connections
    }

    /// Connection of the block's alias.
    pub fn connection(&mut self) -> Result<&mut C> {
        self.connections.connection(&self.alias)
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Check if this block owns the transaction.
    pub fn is_outermost(&self) -> bool {
        self.handle.as_ref().is_some_and(AtomicHandle::is_outermost)
    }

    /// Savepoint created for this block, if any.
    pub fn savepoint(&self) -> Option<&str> {
        self.handle.as_ref().and_then(AtomicHandle::savepoint)
    }

    /// Run `hook` once the outermost transaction commits.
    pub fn on_commit<F>(&mut self, hook: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.connections.on_commit(&self.alias, hook)
    }

    /// Force (or cancel) a rollback when this block exits.
    pub fn set_rollback(&mut self, rollback: bool) -> Result<()> {
        self.connections.set_rollback(&self.alias, rollback)
    }

    pub fn get_rollback(&self) -> Result<bool> {
        self.connections.get_rollback(&self.alias)
    }

    /// Exit the block successfully.
    ///
    /// Commits the transaction or releases the savepoint. Returns
    /// [`Exit::RolledBack`] when the block was marked for rollback.
    pub fn commit(mut self) -> Result<Exit> {
        self.commit_inner()
    }

    /// Exit the block, undoing its work.
    pub fn rollback(mut self) -> Result<()> {
        self.rollback_inner()
    }

    /// Exit the block according to the outcome of its body.
    ///
    /// `Ok` commits; a failed commit is returned instead of the value. `Err`
    /// rolls back and returns the error unchanged. A failure of the rollback
    /// itself is logged.
    pub fn finish<T, E>(mut self, outcome: std::result::Result<T, E>) -> std::result::Result<T, E>
    where
        E: From<Error>,
    {
        match outcome {
            Ok(value) => {
                self.commit_inner().map_err(E::from)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback_inner() {
                    warn!(alias = %self.alias, "rollback after failed atomic block failed: {}", rollback_err);
                }
                Err(err)
            }
        }
    }

    fn take_handle(&mut self) -> Result<AtomicHandle> {
        self.handle
            .take()
            .ok_or_else(|| Error::TransactionManagement("atomic block already exited".to_string()))
    }

    fn commit_inner(&mut self) -> Result<Exit> {
        let handle = self.take_handle()?;
        self.connections.session_mut(&self.alias)?.commit_atomic(handle)
    }

    fn rollback_inner(&mut self) -> Result<()> {
        let handle = self.take_handle()?;
        self.connections.session_mut(&self.alias)?.rollback_atomic(handle)
    }
}

impl<C: Connection> Drop for AtomicBlock<'_, C> {
    fn drop(&mut self) {
        if self.handle.is_none() {
            return;
        }
        if let Err(err) = self.rollback_inner() {
            error!(alias = %self.alias, "failed to roll back dropped atomic block: {}", err);
        }
    }
}

impl<C: Connection> std::fmt::Debug for AtomicBlock<'_, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicBlock")
            .field("alias", &self.alias)
            .field("handle", &self.handle)
            .finish()
    }
}
