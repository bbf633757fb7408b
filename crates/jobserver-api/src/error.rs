// ABOUTME: Error type for the JobServer facade, wrapping store, manager and input errors.
// ABOUTME: kind() maps every variant onto the shared ErrorKind taxonomy.

use jobserver_core::{EntryError, Table};
use jobserver_jobs::{ErrorKind, ManagerError};
use jobserver_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("no {table} entry with key {key}")]
    NotFound { table: Table, key: String },

    #[error("invalid input: {0}")]
    InvalidInput(#[from] EntryError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::NotFound { .. } => ErrorKind::NotFound,
            ApiError::InvalidInput(_) => ErrorKind::InvalidParameters,
            ApiError::Manager(err) => err.kind(),
            ApiError::Store(err) => err.kind(),
        }
    }
}
