// ABOUTME: Pure job lifecycle rules: which request is valid in which state, and what a legal update log looks like.
// ABOUTME: Also defines JobSnapshot, the externally visible view of one job published by its actor.

use std::fmt;

use chrono::{DateTime, Utc};
use jobserver_core::{JobPriority, JobReturnCode, JobState};
use serde::{Deserialize, Serialize};

/// A request a caller can make of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    Start,
    Pause,
    Resume,
    Cancel,
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Request::Start => "start",
            Request::Pause => "pause",
            Request::Resume => "resume",
            Request::Cancel => "cancel",
        };
        f.write_str(s)
    }
}

/// The state a request moves a job into, or `None` when the request is not
/// valid from `current`.
pub fn next_state(current: JobState, request: Request) -> Option<JobState> {
    let next = match (current, request) {
        (JobState::Pending, Request::Start) => JobState::Running,
        (JobState::Running, Request::Pause) => JobState::Pausing,
        (JobState::Paused, Request::Resume) => JobState::Resuming,
        (state, Request::Cancel) if !matches!(state, JobState::Exiting | JobState::Closed) => {
            JobState::Exiting
        }
        _ => return None,
    };
    debug_assert!(current.can_transition_to(next));
    Some(next)
}

/// Whether `history` is a complete or in-progress legal log:
/// `Pending, Running, [Pausing, Paused, Resuming, Running]*, Exiting, Closed`,
/// where a cancel may cut any prefix short with `Exiting, Closed`.
pub fn is_valid_history(history: &[JobState]) -> bool {
    let Some((first, rest)) = history.split_first() else {
        return true;
    };
    if *first != JobState::Pending {
        return false;
    }
    let mut current = *first;
    for next in rest {
        if !current.can_transition_to(*next) {
            return false;
        }
        current = *next;
    }
    true
}

/// A point-in-time view of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub template: String,
    pub priority: JobPriority,
    pub state: JobState,
    pub result: Option<JobReturnCode>,
    /// Index of the stage running now, or of the next one to run.
    pub stage_index: usize,
    pub stage_count: usize,
    pub current_stage: Option<String>,
    /// Set when a durable write failed and the job was abandoned.
    pub fault: Option<String>,
    pub init_time: DateTime<Utc>,
}

impl JobSnapshot {
    /// Closed, or faulted with no further progress possible.
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal() || (self.fault.is_some() && self.result.is_some())
    }
}
