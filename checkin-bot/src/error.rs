//! Error types shared across the store, session and configuration layers
//!
//! Retryable and fatal site responses are not errors: they are
//! `AttemptOutcome` values classified by the site adapter. The types here
//! cover the conditions that end a target's cycle outright.

use rusqlite::ErrorCode;
use std::path::PathBuf;

/// Failure to read or write the state store
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("data directory error: {0}")]
    Io(#[from] std::io::Error),

    /// The database file or a stored row cannot be decoded. Never treated as
    /// "no record", since that could cause a duplicate check-in.
    #[error("corrupt state: {0}")]
    Corrupt(String),

    #[error("database connection lock poisoned")]
    Poisoned,
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(e.code, ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt) =>
            {
                StorageError::Corrupt(err.to_string())
            }
            _ => StorageError::Sqlite(err),
        }
    }
}

/// Failure to obtain a usable session for a target
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no credentials configured for target '{0}'")]
    MissingCredentials(String),

    #[error("malformed credentials for target '{target}': {reason}")]
    Malformed { target: String, reason: String },

    #[error("credentials rejected for target '{target}': {reason}")]
    Rejected { target: String, reason: String },

    #[error("captcha could not be solved: {0}")]
    Captcha(String),

    #[error("no site adapter registered for '{0}'")]
    UnknownSite(String),

    /// Login could not be completed for a transient reason (network, 5xx,
    /// Cloudflare). Counts as a failed attempt, not an auth failure.
    #[error("login unavailable: {0}")]
    Unavailable(String),
}

impl AuthError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::Unavailable(_))
    }
}

/// Invalid or unreadable configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path:?}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("invalid target list: {0}")]
    Targets(String),
}

impl ConfigError {
    pub fn invalid(key: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}
