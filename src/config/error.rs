//! Settings error types.

use std::path::PathBuf;

use thiserror::Error;

/// Malformed process-wide settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// A retry count that isn't a non-negative integer.
    #[error("{var} must be a non-negative integer, got {value:?}")]
    InvalidRetry { var: &'static str, value: String },

    /// Neither a five-character SQLSTATE code nor a known condition name.
    #[error("invalid SQLSTATE code {0:?}")]
    InvalidSqlState(String),

    /// The settings file could not be read.
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed settings: {0}")]
    Json(#[from] serde_json::Error),
}
