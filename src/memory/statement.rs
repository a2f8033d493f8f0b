//! Transaction-control statements understood by the in-memory backend.

use std::borrow::Cow;

use sqlparser::ast as sp;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser as SqlParser;

use crate::error::{DatabaseError, SqlState};
use crate::isolation::IsolationLevel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ControlStatement {
    Begin,
    Commit,
    Rollback,
    Savepoint(String),
    ReleaseSavepoint(String),
    RollbackToSavepoint(String),
    SetIsolationLevel(IsolationLevel),
}

impl ControlStatement {
    /// Parse a single control statement.
    pub(crate) fn parse(sql: &str) -> Result<Self, DatabaseError> {
        let sql = normalize_set(sql);
        let statements = SqlParser::parse_sql(&PostgreSqlDialect {}, &sql)
            .map_err(|err| DatabaseError::new(SqlState::SYNTAX_ERROR, err.to_string()))?;

        let [statement] = statements.as_slice() else {
            return Err(DatabaseError::new(
                SqlState::SYNTAX_ERROR,
                format!("expected exactly one statement, got {}", statements.len()),
            ));
        };

        match statement {
            sp::Statement::StartTransaction { .. } => Ok(Self::Begin),
            sp::Statement::Commit { .. } => Ok(Self::Commit),
            sp::Statement::Rollback {
                savepoint: Some(name),
                ..
            } => Ok(Self::RollbackToSavepoint(name.value.clone())),
            sp::Statement::Rollback { savepoint: None, .. } => Ok(Self::Rollback),
            sp::Statement::Savepoint { name } => Ok(Self::Savepoint(name.value.clone())),
            sp::Statement::ReleaseSavepoint { name } => {
                Ok(Self::ReleaseSavepoint(name.value.clone()))
            }
            sp::Statement::SetTransaction { modes, .. } => Self::convert_modes(modes),
            other => Err(DatabaseError::new(
                SqlState::FEATURE_NOT_SUPPORTED,
                format!("statement not supported: {other}"),
            )),
        }
    }

    fn convert_modes(modes: &[sp::TransactionMode]) -> Result<Self, DatabaseError> {
        let level = modes.iter().find_map(|mode| match mode {
            sp::TransactionMode::IsolationLevel(level) => Some(level),
            _ => None,
        });

        match level {
            // PostgreSQL runs READ UNCOMMITTED as READ COMMITTED.
            Some(sp::TransactionIsolationLevel::ReadUncommitted)
            | Some(sp::TransactionIsolationLevel::ReadCommitted) => {
                Ok(Self::SetIsolationLevel(IsolationLevel::ReadCommitted))
            }
            Some(sp::TransactionIsolationLevel::RepeatableRead) => {
                Ok(Self::SetIsolationLevel(IsolationLevel::RepeatableRead))
            }
            Some(sp::TransactionIsolationLevel::Serializable) => {
                Ok(Self::SetIsolationLevel(IsolationLevel::Serializable))
            }
            #[allow(unreachable_patterns)]
            Some(other) => Err(DatabaseError::new(
                SqlState::FEATURE_NOT_SUPPORTED,
                format!("isolation level {other} is not supported"),
            )),
            None => Err(DatabaseError::new(
                SqlState::FEATURE_NOT_SUPPORTED,
                "only SET TRANSACTION ISOLATION LEVEL is supported",
            )),
        }
    }
}

/// Upper-case a `SET` statement.
///
/// The PostgreSQL dialect reads a lower-case `set transaction ...` as a
/// variable assignment. `SET` statements carry no identifiers, so the whole
/// text can be folded.
fn normalize_set(sql: &str) -> Cow<'_, str> {
    let is_set = sql
        .split_whitespace()
        .next()
        .is_some_and(|word| word.eq_ignore_ascii_case("set"));
    if is_set {
        Cow::Owned(sql.to_ascii_uppercase())
    } else {
        Cow::Borrowed(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_transaction_control() {
        assert_eq!(ControlStatement::parse("BEGIN").unwrap(), ControlStatement::Begin);
        assert_eq!(ControlStatement::parse("COMMIT").unwrap(), ControlStatement::Commit);
        assert_eq!(
            ControlStatement::parse("ROLLBACK").unwrap(),
            ControlStatement::Rollback
        );
        assert_eq!(
            ControlStatement::parse("SAVEPOINT s_1").unwrap(),
            ControlStatement::Savepoint("s_1".to_string())
        );
        assert_eq!(
            ControlStatement::parse("RELEASE SAVEPOINT s_1").unwrap(),
            ControlStatement::ReleaseSavepoint("s_1".to_string())
        );
        assert_eq!(
            ControlStatement::parse("ROLLBACK TO SAVEPOINT s_1").unwrap(),
            ControlStatement::RollbackToSavepoint("s_1".to_string())
        );
    }

    #[test]
    fn test_parse_set_isolation_level() {
        assert_eq!(
            ControlStatement::parse("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE").unwrap(),
            ControlStatement::SetIsolationLevel(IsolationLevel::Serializable)
        );
        assert_eq!(
            ControlStatement::parse("set transaction isolation level repeatable read").unwrap(),
            ControlStatement::SetIsolationLevel(IsolationLevel::RepeatableRead)
        );
        assert_eq!(
            ControlStatement::parse("SET TRANSACTION ISOLATION LEVEL READ UNCOMMITTED").unwrap(),
            ControlStatement::SetIsolationLevel(IsolationLevel::ReadCommitted)
        );
    }

    #[test]
    fn test_parse_set_transaction_any_case() {
        assert_eq!(
            ControlStatement::parse("set transaction isolation level serializable").unwrap(),
            ControlStatement::SetIsolationLevel(IsolationLevel::Serializable)
        );
        assert_eq!(
            ControlStatement::parse("  Set Transaction Isolation Level Read Committed").unwrap(),
            ControlStatement::SetIsolationLevel(IsolationLevel::ReadCommitted)
        );

        let err = ControlStatement::parse("set transaction read only").unwrap_err();
        assert_eq!(err.code(), &SqlState::FEATURE_NOT_SUPPORTED);

        // Savepoint names keep their case
        assert_eq!(
            ControlStatement::parse("savepoint s_01abc").unwrap(),
            ControlStatement::Savepoint("s_01abc".to_string())
        );
    }

    #[test]
    fn test_parse_rejects_other_statements() {
        let err = ControlStatement::parse("SELECT 1").unwrap_err();
        assert_eq!(err.code(), &SqlState::FEATURE_NOT_SUPPORTED);

        let err = ControlStatement::parse("SET TRANSACTION READ ONLY").unwrap_err();
        assert_eq!(err.code(), &SqlState::FEATURE_NOT_SUPPORTED);

        let err = ControlStatement::parse("BEGIN; COMMIT").unwrap_err();
        assert_eq!(err.code(), &SqlState::SYNTAX_ERROR);

        let err = ControlStatement::parse("SAVEPOINT").unwrap_err();
        assert_eq!(err.code(), &SqlState::SYNTAX_ERROR);
    }
}
