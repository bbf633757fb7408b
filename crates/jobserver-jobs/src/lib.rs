// ABOUTME: Job lifecycle for jobserver: stages, templates, the per-job state machine actor and the job manager.
// ABOUTME: Every transition is appended to the store before it takes effect in memory.

pub mod error;
mod job;
pub mod manager;
pub mod stage;
pub mod state;
pub mod template;

pub use error::{JobError, ManagerError};
pub use jobserver_store::ErrorKind;
pub use manager::{Admission, JobManager, JobStatusView, PauseAllReport, PauseFailure};
pub use stage::{Stage, StageFactory, StageKind};
pub use state::{JobSnapshot, Request, is_valid_history, next_state};
pub use template::{
    JobParameters, JobTemplate, ParamKind, ParameterSpec, ResolvedParameters, TemplateInfo,
    TemplateRegistry,
};
