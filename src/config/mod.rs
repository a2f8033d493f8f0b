//! Process-wide settings and per-invocation retry policy.
//!
//! Settings are read from the environment the first time they are needed
//! and can be replaced at runtime with [`configure`]. A [`RetryPolicy`] is
//! resolved from them once per retried invocation and never changes after.

use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{DatabaseCause, Result, SqlState};

mod error;

pub use error::SettingsError;

/// Default retry count.
pub const RETRY_ENV: &str = "PGATOMIC_RETRY";
/// Comma separated SQLSTATE codes or condition names treated as retryable.
pub const RETRY_EXCEPTIONS_ENV: &str = "PGATOMIC_RETRY_EXCEPTIONS";

/// The errors retried when nothing else is configured.
pub fn default_retry_exceptions() -> Vec<SqlState> {
    vec![SqlState::SERIALIZATION_FAILURE, SqlState::DEADLOCK_DETECTED]
}

/// Process-wide defaults for atomic blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Retry budget of any atomic block that doesn't pass `retry`.
    pub retry: u32,
    /// Database errors that trigger a retry.
    pub retry_exceptions: Vec<SqlState>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retry: 0,
            retry_exceptions: default_retry_exceptions(),
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default retry count.
    pub fn retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    /// Set the retryable error codes.
    pub fn retry_exceptions(mut self, states: impl IntoIterator<Item = SqlState>) -> Self {
        self.retry_exceptions = states.into_iter().collect();
        self
    }

    /// Load settings from `PGATOMIC_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings from any key/value source using the environment variable names.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut settings = Self::default();

        if let Some(raw) = lookup(RETRY_ENV) {
            settings.retry = raw.trim().parse().map_err(|_| SettingsError::InvalidRetry {
                var: RETRY_ENV,
                value: raw.clone(),
            })?;
        }

        if let Some(raw) = lookup(RETRY_EXCEPTIONS_ENV) {
            settings.retry_exceptions = raw
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::parse::<SqlState>)
                .collect::<Result<_>>()?;
        }

        Ok(settings)
    }

    /// Parse settings from JSON; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json).map_err(SettingsError::from)?)
    }

    /// Read settings from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }
}

static SETTINGS: OnceLock<RwLock<Settings>> = OnceLock::new();

fn global() -> &'static RwLock<Settings> {
    SETTINGS.get_or_init(|| {
        let settings = Settings::from_env().unwrap_or_else(|err| {
            tracing::warn!("ignoring environment settings: {}", err);
            Settings::default()
        });
        RwLock::new(settings)
    })
}

/// Snapshot of the current process-wide settings.
pub fn settings() -> Settings {
    global().read().clone()
}

/// Replace the process-wide settings, returning the previous ones.
pub fn configure(settings: Settings) -> Settings {
    std::mem::replace(&mut *global().write(), settings)
}

/// Retry budget and retryable errors for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    retry: u32,
    retryable: HashSet<SqlState>,
}

impl RetryPolicy {
    pub fn new(retry: u32, retryable: impl IntoIterator<Item = SqlState>) -> Self {
        Self {
            retry,
            retryable: retryable.into_iter().collect(),
        }
    }

    /// A policy that never retries.
    pub fn never() -> Self {
        Self::new(0, default_retry_exceptions())
    }

    /// Resolve explicit overrides against the given settings.
    pub fn resolve(retry: Option<u32>, retry_on: Option<&[SqlState]>, settings: &Settings) -> Self {
        let retryable = retry_on.unwrap_or(&settings.retry_exceptions);
        Self::new(retry.unwrap_or(settings.retry), retryable.iter().cloned())
    }

    /// Maximum number of re-executions after the first attempt.
    pub fn retry(&self) -> u32 {
        self.retry
    }

    pub fn retryable(&self) -> impl Iterator<Item = &SqlState> {
        self.retryable.iter()
    }

    /// Check if the error's database cause is in the retryable set.
    pub fn is_retryable<E: DatabaseCause + ?Sized>(&self, err: &E) -> bool {
        err.sql_state()
            .is_some_and(|state| self.retryable.contains(state))
    }

    /// Check if a failure of the zero-based `attempt` should be retried.
    pub fn should_retry<E: DatabaseCause + ?Sized>(&self, attempt: u32, err: &E) -> bool {
        attempt < self.retry && self.is_retryable(err)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;
    use crate::error::{DatabaseError, Error};

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.retry, 0);
        assert_eq!(
            settings.retry_exceptions,
            vec![SqlState::SERIALIZATION_FAILURE, SqlState::DEADLOCK_DETECTED]
        );
    }

    #[test]
    fn test_settings_from_lookup() {
        let vars: HashMap<&str, &str> = [
            (RETRY_ENV, " 3 "),
            (RETRY_EXCEPTIONS_ENV, "deadlock_detected, 40001,"),
        ]
        .into_iter()
        .collect();

        let settings = Settings::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(settings.retry, 3);
        assert_eq!(
            settings.retry_exceptions,
            vec![SqlState::DEADLOCK_DETECTED, SqlState::SERIALIZATION_FAILURE]
        );

        let empty = Settings::from_lookup(|_| None).unwrap();
        assert_eq!(empty, Settings::default());
    }

    #[test]
    fn test_settings_from_lookup_rejects_garbage() {
        let err = Settings::from_lookup(|key| (key == RETRY_ENV).then(|| "-1".to_string()))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Settings(SettingsError::InvalidRetry { var: RETRY_ENV, .. })
        ));

        let err = Settings::from_lookup(|key| {
            (key == RETRY_EXCEPTIONS_ENV).then(|| "not a code".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, Error::Settings(SettingsError::InvalidSqlState(_))));
    }

    #[test]
    fn test_settings_from_json_and_file() {
        let settings = Settings::from_json(r#"{"retry": 2}"#).unwrap();
        assert_eq!(settings.retry, 2);
        assert_eq!(settings.retry_exceptions, default_retry_exceptions());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"retry_exceptions": ["40P01"]}}"#).unwrap();
        let settings = Settings::from_file(file.path()).unwrap();
        assert_eq!(settings.retry, 0);
        assert_eq!(settings.retry_exceptions, vec![SqlState::DEADLOCK_DETECTED]);

        assert!(matches!(
            Settings::from_json("{\"retry\": \"many\"}"),
            Err(Error::Settings(SettingsError::Json(_)))
        ));
        assert!(matches!(
            Settings::from_file(file.path().with_extension("missing")),
            Err(Error::Settings(SettingsError::Read { .. }))
        ));
    }

    #[test]
    fn test_policy_resolution_order() {
        let settings = Settings::new()
            .retry(5)
            .retry_exceptions([SqlState::DEADLOCK_DETECTED]);

        let inherited = RetryPolicy::resolve(None, None, &settings);
        assert_eq!(inherited.retry(), 5);
        assert!(inherited.is_retryable(&DatabaseError::deadlock_detected()));
        assert!(!inherited.is_retryable(&DatabaseError::serialization_failure("x")));

        let explicit = RetryPolicy::resolve(
            Some(1),
            Some(&[SqlState::SERIALIZATION_FAILURE]),
            &settings,
        );
        assert_eq!(explicit.retry(), 1);
        assert!(explicit.is_retryable(&DatabaseError::serialization_failure("x")));
        assert!(!explicit.is_retryable(&DatabaseError::deadlock_detected()));
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::new(2, default_retry_exceptions());
        let conflict = Error::from(DatabaseError::serialization_failure("concurrent update"));
        let unique = Error::from(DatabaseError::new(SqlState::UNIQUE_VIOLATION, "duplicate key"));

        assert!(policy.should_retry(0, &conflict));
        assert!(policy.should_retry(1, &conflict));
        assert!(!policy.should_retry(2, &conflict));
        assert!(!policy.should_retry(0, &unique));
        assert!(!policy.should_retry(0, &Error::Configuration("x".into())));
        assert!(!RetryPolicy::never().should_retry(0, &conflict));
    }
}
