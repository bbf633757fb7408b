// ABOUTME: Error types for job actors and the job manager.
// ABOUTME: Both expose kind() so callers can branch on the shared ErrorKind taxonomy.

use jobserver_core::JobState;
use jobserver_store::{ErrorKind, StoreError};
use thiserror::Error;

use crate::state::Request;

/// Errors returned by a job actor.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {job_id} cannot {request} while {state}")]
    InvalidTransition {
        job_id: String,
        state: JobState,
        request: Request,
    },

    #[error("job {0} is no longer running")]
    ChannelClosed(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            JobError::ChannelClosed(_) => ErrorKind::Storage,
            JobError::Store(err) => err.kind(),
        }
    }
}

/// Errors returned by [`JobManager`](crate::JobManager) operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("client not found: {0}")]
    ClientNotFound(String),

    #[error("job template not found: {0}")]
    TemplateNotFound(String),

    #[error("invalid parameters for template {template}: {reason}")]
    InvalidParameters { template: String, reason: String },

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ManagerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ManagerError::NotFound(_)
            | ManagerError::ClientNotFound(_)
            | ManagerError::TemplateNotFound(_) => ErrorKind::NotFound,
            ManagerError::InvalidParameters { .. } => ErrorKind::InvalidParameters,
            ManagerError::Job(err) => err.kind(),
            ManagerError::Store(err) => err.kind(),
        }
    }
}
