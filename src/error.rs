//! Error types for atomic blocks.
//!
//! Database failures carry the SQLSTATE code reported by the server. The
//! retry loop classifies failures by that code only, so callers' own error
//! types just need to expose it through [`DatabaseCause`].

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::config::SettingsError;
use crate::isolation::IsolationLevel;

/// Result type for atomic-block operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A five-character SQLSTATE error code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SqlState(Cow<'static, str>);

impl SqlState {
    /// `40001`
    pub const SERIALIZATION_FAILURE: SqlState = SqlState(Cow::Borrowed("40001"));
    /// `40P01`
    pub const DEADLOCK_DETECTED: SqlState = SqlState(Cow::Borrowed("40P01"));
    /// `23505`
    pub const UNIQUE_VIOLATION: SqlState = SqlState(Cow::Borrowed("23505"));
    /// `25001`
    pub const ACTIVE_SQL_TRANSACTION: SqlState = SqlState(Cow::Borrowed("25001"));
    /// `25P01`
    pub const NO_ACTIVE_SQL_TRANSACTION: SqlState = SqlState(Cow::Borrowed("25P01"));
    /// `25P02`
    pub const IN_FAILED_SQL_TRANSACTION: SqlState = SqlState(Cow::Borrowed("25P02"));
    /// `3B001`
    pub const INVALID_SAVEPOINT_SPECIFICATION: SqlState = SqlState(Cow::Borrowed("3B001"));
    /// `42601`
    pub const SYNTAX_ERROR: SqlState = SqlState(Cow::Borrowed("42601"));
    /// `0A000`
    pub const FEATURE_NOT_SUPPORTED: SqlState = SqlState(Cow::Borrowed("0A000"));

    const NAMED: [(&'static str, SqlState); 9] = [
        ("serialization_failure", Self::SERIALIZATION_FAILURE),
        ("deadlock_detected", Self::DEADLOCK_DETECTED),
        ("unique_violation", Self::UNIQUE_VIOLATION),
        ("active_sql_transaction", Self::ACTIVE_SQL_TRANSACTION),
        ("no_active_sql_transaction", Self::NO_ACTIVE_SQL_TRANSACTION),
        ("in_failed_sql_transaction", Self::IN_FAILED_SQL_TRANSACTION),
        ("invalid_savepoint_specification", Self::INVALID_SAVEPOINT_SPECIFICATION),
        ("syntax_error", Self::SYNTAX_ERROR),
        ("feature_not_supported", Self::FEATURE_NOT_SUPPORTED),
    ];

    /// Build a code from its five-character form.
    pub fn from_code(code: &str) -> Result<Self> {
        if code.len() == 5 && code.chars().all(|c| c.is_ascii_alphanumeric()) {
            Ok(SqlState(Cow::Owned(code.to_ascii_uppercase())))
        } else {
            Err(SettingsError::InvalidSqlState(code.to_string()).into())
        }
    }

    /// The five-character code.
    pub fn code(&self) -> &str {
        &self.0
    }

    /// The PostgreSQL condition name, for codes this crate knows about.
    pub fn condition_name(&self) -> Option<&'static str> {
        Self::NAMED
            .iter()
            .find(|(_, state)| state == self)
            .map(|(name, _)| *name)
    }
}

impl fmt::Display for SqlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Accepts either the code (`40001`) or the condition name (`serialization_failure`).
impl FromStr for SqlState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let lowered = s.to_ascii_lowercase();
        if let Some((_, state)) = Self::NAMED.iter().find(|(name, _)| *name == lowered) {
            return Ok(state.clone());
        }
        Self::from_code(s)
    }
}

impl Serialize for SqlState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

impl<'de> Deserialize<'de> for SqlState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// An error reported by the database server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (SQLSTATE {code})")]
pub struct DatabaseError {
    code: SqlState,
    message: String,
}

impl DatabaseError {
    pub fn new(code: SqlState, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// `could not serialize access due to ...`
    pub fn serialization_failure(detail: &str) -> Self {
        Self::new(
            SqlState::SERIALIZATION_FAILURE,
            format!("could not serialize access due to {detail}"),
        )
    }

    pub fn deadlock_detected() -> Self {
        Self::new(SqlState::DEADLOCK_DETECTED, "deadlock detected")
    }

    pub fn code(&self) -> &SqlState {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors raised while configuring, entering or leaving atomic blocks.
#[derive(Debug, Error)]
pub enum Error {
    /// Failure reported by the database.
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// Invalid or contradictory atomic-block configuration.
    #[error("improperly configured: {0}")]
    Configuration(String),

    /// A nested block asked for an isolation level its parent can no longer adopt.
    #[error(
        "nested atomic blocks inherit the isolation level of their parent transaction; \
         cannot switch to {requested}"
    )]
    IsolationInherited {
        requested: IsolationLevel,
        #[source]
        source: DatabaseError,
    },

    /// The connection's vendor cannot honour the request.
    #[error("not supported: {0}")]
    Unsupported(String),

    /// Misuse of the transaction machinery itself.
    #[error("transaction management error: {0}")]
    TransactionManagement(String),

    /// No connection is registered under the alias.
    #[error("the connection {0:?} doesn't exist")]
    ConnectionDoesNotExist(String),

    /// Malformed process-wide settings.
    #[error("invalid settings: {0}")]
    Settings(#[from] SettingsError),
}

impl Error {
    /// Check if this error is a configuration error.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_) | Error::IsolationInherited { .. }
        )
    }

    /// The underlying database error, if any.
    pub fn database_error(&self) -> Option<&DatabaseError> {
        match self {
            Error::Database(err) => Some(err),
            _ => None,
        }
    }
}

/// Exposes the database failure underlying an error.
///
/// Implemented by any error type returned from work run under
/// [`Atomic::run`](crate::Atomic::run). Returning `None` means the error is
/// never retried.
pub trait DatabaseCause {
    fn sql_state(&self) -> Option<&SqlState>;
}

impl DatabaseCause for Error {
    fn sql_state(&self) -> Option<&SqlState> {
        self.database_error().map(DatabaseError::code)
    }
}

impl DatabaseCause for DatabaseError {
    fn sql_state(&self) -> Option<&SqlState> {
        Some(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sql_state() {
        assert_eq!(
            "40001".parse::<SqlState>().unwrap(),
            SqlState::SERIALIZATION_FAILURE
        );
        assert_eq!(
            "Deadlock_Detected".parse::<SqlState>().unwrap(),
            SqlState::DEADLOCK_DETECTED
        );
        assert_eq!("40p01".parse::<SqlState>().unwrap(), SqlState::DEADLOCK_DETECTED);
        assert!("4000".parse::<SqlState>().is_err());
        assert!("no_such_condition".parse::<SqlState>().is_err());
    }

    #[test]
    fn test_condition_name() {
        assert_eq!(
            SqlState::UNIQUE_VIOLATION.condition_name(),
            Some("unique_violation")
        );
        assert_eq!(SqlState::from_code("XX000").unwrap().condition_name(), None);
    }

    #[test]
    fn test_database_cause() {
        let err = Error::from(DatabaseError::serialization_failure("concurrent update"));
        assert_eq!(err.sql_state(), Some(&SqlState::SERIALIZATION_FAILURE));
        assert!(err.to_string().contains("40001"));

        let config = Error::Configuration("bad".to_string());
        assert_eq!(config.sql_state(), None);
        assert!(config.is_configuration());
    }

    #[test]
    fn test_sql_state_serde() {
        let states: Vec<SqlState> =
            serde_json::from_str(r#"["serialization_failure", "40P01"]"#).unwrap();
        assert_eq!(
            states,
            vec![SqlState::SERIALIZATION_FAILURE, SqlState::DEADLOCK_DETECTED]
        );
        assert_eq!(
            serde_json::to_string(&SqlState::DEADLOCK_DETECTED).unwrap(),
            r#""40P01""#
        );
    }
}
