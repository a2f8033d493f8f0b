//! Transaction isolation levels.
//!
//! Three levels can be requested for an atomic block:
//! - ReadCommitted: each statement sees data committed before it began
//! - RepeatableRead: every statement sees the snapshot taken by the first one
//! - Serializable: snapshot reads, plus the database aborts transactions whose
//!   outcome could differ from some serial ordering

use std::fmt;

use crate::error::Error;

/// `READ COMMITTED`
pub const READ_COMMITTED: IsolationLevel = IsolationLevel::ReadCommitted;
/// `REPEATABLE READ`
pub const REPEATABLE_READ: IsolationLevel = IsolationLevel::RepeatableRead;
/// `SERIALIZABLE`
pub const SERIALIZABLE: IsolationLevel = IsolationLevel::Serializable;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum IsolationLevel {
    /// Read Committed isolation, PostgreSQL's default.
    ///
    /// Concurrent updates to the same row are applied one after the other,
    /// so this level never reports serialization failures.
    #[default]
    ReadCommitted,

    /// Repeatable Read isolation (snapshot isolation).
    ///
    /// Updating a row that another transaction changed after the snapshot was
    /// taken fails with a serialization failure.
    RepeatableRead,

    /// Serializable isolation.
    ///
    /// Like Repeatable Read, and additionally fails transactions whose reads
    /// were invalidated by concurrent commits.
    Serializable,
}

impl IsolationLevel {
    /// SQL spelling used in `SET TRANSACTION ISOLATION LEVEL`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    /// The statement that applies this level to the current transaction.
    pub fn set_transaction_sql(&self) -> String {
        format!("SET TRANSACTION ISOLATION LEVEL {}", self.as_sql())
    }

    /// Check if this isolation level reads from a transaction-wide snapshot.
    pub fn uses_snapshot(&self) -> bool {
        !matches!(self, IsolationLevel::ReadCommitted)
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Parse isolation level from string (SQL syntax, case-insensitive).
impl std::str::FromStr for IsolationLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "READ COMMITTED" | "READ_COMMITTED" => Ok(IsolationLevel::ReadCommitted),
            "REPEATABLE READ" | "REPEATABLE_READ" => Ok(IsolationLevel::RepeatableRead),
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            _ => Err(Error::Configuration(format!(
                "invalid isolation level \"{s}\""
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_isolation() {
        assert_eq!(IsolationLevel::default(), READ_COMMITTED);
    }

    #[test]
    fn test_uses_snapshot() {
        assert!(!READ_COMMITTED.uses_snapshot());
        assert!(REPEATABLE_READ.uses_snapshot());
        assert!(SERIALIZABLE.uses_snapshot());
    }

    #[test]
    fn test_parse_isolation() {
        assert_eq!(
            "read committed".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert_eq!(
            "Repeatable Read".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::RepeatableRead
        );
        assert_eq!(
            "serializable".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::Serializable
        );

        let err = "snapshot".parse::<IsolationLevel>().unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("snapshot"));
    }

    #[test]
    fn test_set_transaction_sql_is_uppercase() {
        let level: IsolationLevel = "repeatable read".parse().unwrap();
        assert_eq!(
            level.set_transaction_sql(),
            "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ"
        );
    }
}
