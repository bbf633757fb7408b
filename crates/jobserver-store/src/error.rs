// ABOUTME: Error type for the persistence engine and the mapping from SQLite failures onto it.
// ABOUTME: ErrorKind is the caller-facing taxonomy shared with the job manager.

use std::path::PathBuf;

use jobserver_core::{EntryError, Table};
use rusqlite::ErrorCode;
use thiserror::Error;

/// The error categories every public operation reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    StoreNotFound,
    ConstraintViolation,
    NotFound,
    InvalidTransition,
    InvalidParameters,
    ConsistencyFault,
    /// The store itself failed (I/O, corruption, closed handle).
    Storage,
}

/// Errors that can occur during persistence operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store not found: {0}")]
    StoreNotFound(PathBuf),

    #[error("constraint violation on {table}: {message}")]
    ConstraintViolation { table: Table, message: String },

    #[error("no {table} entry with key {key}")]
    NotFound { table: Table, key: String },

    #[error("consistency fault: {matches} {table} rows share key {key}")]
    ConsistencyFault {
        table: Table,
        key: String,
        matches: usize,
    },

    #[error("{table} has a {expected}-part key, got {got} values")]
    KeyArity {
        table: Table,
        expected: usize,
        got: usize,
    },

    #[error("{table} has no column named {column}")]
    UnknownColumn { table: Table, column: String },

    #[error("column {column} of {table} is not a timestamp")]
    NotATimestamp { table: Table, column: String },

    #[error("entry error: {0}")]
    Entry(#[from] EntryError),

    #[error("store is disconnected")]
    Disconnected,

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::StoreNotFound(_) => ErrorKind::StoreNotFound,
            StoreError::ConstraintViolation { .. } => ErrorKind::ConstraintViolation,
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::ConsistencyFault { .. } => ErrorKind::ConsistencyFault,
            StoreError::KeyArity { .. }
            | StoreError::UnknownColumn { .. }
            | StoreError::NotATimestamp { .. } => ErrorKind::InvalidParameters,
            StoreError::Entry(_) | StoreError::Disconnected | StoreError::Sqlite(_) => {
                ErrorKind::Storage
            }
        }
    }

    /// Translate a SQLite failure raised while writing to `table`, turning
    /// primary-key, unique and foreign-key failures into constraint violations.
    pub(crate) fn from_write(table: Table, err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(inner, message)
                if inner.code == ErrorCode::ConstraintViolation =>
            {
                StoreError::ConstraintViolation {
                    table,
                    message: message.clone().unwrap_or_else(|| inner.to_string()),
                }
            }
            _ => StoreError::Sqlite(err),
        }
    }
}
