//! Error kinds surfaced internally by [`crate::file_store`] and [`crate::db`].
//!
//! Per the library's propagation rules, none of these cross the public
//! [`crate::KVStorage`] surface directly — public methods return `bool` or
//! `Option<T>` and log the detail here via `tracing`. The typed enum exists
//! so internal call sites can match on *why* something failed (a gated
//! reopen vs. a genuine SQLite error are handled differently).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database busy")]
    DbBusy,
    #[error("database failure: {0}")]
    DbFailure(String),
    #[error("database unavailable (reopen gated)")]
    DbUnavailable,
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ffi::ErrorCode;
        if let rusqlite::Error::SqliteFailure(err, _) = &e {
            if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) {
                return StorageError::DbBusy;
            }
        }
        StorageError::DbFailure(e.to_string())
    }
}
