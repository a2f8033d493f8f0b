//! Retrying a unit of work in fresh outermost transactions.

use tracing::{debug, warn};

use super::block::Invocation;
use super::Atomic;
use crate::config::{self, RetryPolicy};
use crate::connection::{Connection, Connections};
use crate::error::{DatabaseCause, Error, Result};

impl Atomic {
    /// Run `work` inside an atomic block, retrying retryable failures.
    ///
    /// Every attempt opens a new block; the previous one has been rolled back
    /// entirely by then. A failure is retried while budget remains and its
    /// database cause is one of the retryable errors, whether it came from the
    /// work itself or from the final commit. Any other failure, or the last
    /// one, is returned unchanged.
    ///
    /// Nested inside another atomic block, the budget must resolve to zero:
    /// `work` runs exactly once and its errors propagate to the enclosing
    /// block, which decides about retries. A non-zero budget there, explicit
    /// or from the process-wide settings, is a configuration error.
    pub fn run<C, T, E, F>(&self, connections: &mut Connections<C>, mut work: F) -> std::result::Result<T, E>
    where
        C: Connection,
        E: From<Error> + DatabaseCause,
        F: FnMut(&mut Connections<C>) -> std::result::Result<T, E>,
    {
        let policy = self.retry_policy(connections).map_err(E::from)?;

        let mut attempt: u32 = 0;
        loop {
            match self.attempt(connections, policy.retry(), &mut work) {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(alias = %self.using, attempts = attempt + 1, "atomic block succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if policy.should_retry(attempt, &err) => {
                    attempt += 1;
                    warn!(
                        alias = %self.using,
                        attempt,
                        retry = policy.retry(),
                        sqlstate = %err.sql_state().map(|state| state.code()).unwrap_or_default(),
                        "retrying atomic block"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn attempt<C, T, E, F>(
        &self,
        connections: &mut Connections<C>,
        retry: u32,
        work: &mut F,
    ) -> std::result::Result<T, E>
    where
        C: Connection,
        E: From<Error>,
        F: FnMut(&mut Connections<C>) -> std::result::Result<T, E>,
    {
        let mut block = self
            .open(connections, Invocation::Callable, retry)
            .map_err(E::from)?;
        let outcome = work(block.connections());
        block.finish(outcome)
    }

    /// Resolve the retry policy of one invocation against `connections`.
    ///
    /// Explicit `retry` and `retry_on` values win over the process-wide
    /// settings. Fails for an unknown alias.
    pub fn retry_policy<C: Connection>(&self, connections: &Connections<C>) -> Result<RetryPolicy> {
        connections.session(&self.using)?;
        Ok(RetryPolicy::resolve(
            self.retry,
            self.retry_on.as_deref(),
            &config::settings(),
        ))
    }

    /// Bind `func` to this configuration.
    ///
    /// The returned [`AtomicFn`] can be called any number of times, from any
    /// number of threads; each call is an independent invocation with its
    /// own retry budget.
    pub fn wrap<F>(self, func: F) -> AtomicFn<F> {
        AtomicFn { atomic: self, func }
    }
}

/// A function bound to an [`Atomic`] configuration.
#[derive(Debug, Clone)]
pub struct AtomicFn<F> {
    atomic: Atomic,
    func: F,
}

impl<F> AtomicFn<F> {
    /// Call the function in an atomic block, retrying as configured.
    ///
    /// `args` is cloned for every attempt.
    pub fn call<C, A, T, E>(&self, connections: &mut Connections<C>, args: A) -> std::result::Result<T, E>
    where
        C: Connection,
        A: Clone,
        E: From<Error> + DatabaseCause,
        F: Fn(&mut Connections<C>, A) -> std::result::Result<T, E>,
    {
        self.atomic
            .run(connections, |conns| (self.func)(conns, args.clone()))
    }

    pub fn atomic(&self) -> &Atomic {
        &self.atomic
    }
}
