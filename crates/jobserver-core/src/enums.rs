// ABOUTME: Enumerations shared across jobserver: job states, return codes, priorities, severities and update kinds.
// ABOUTME: Each persisted enumeration implements StoredEnum so the store only ever sees its integer code.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entry::StoredEnum;

macro_rules! stored_enum {
    ($name:ident { $($variant:ident = $code:expr),+ $(,)? }) => {
        impl StoredEnum for $name {
            fn code(&self) -> i64 {
                match self {
                    $($name::$variant => $code,)+
                }
            }

            fn from_code(code: i64) -> Option<Self> {
                match code {
                    $($code => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

/// The externally visible lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Pausing,
    Paused,
    Resuming,
    Exiting,
    Closed,
}

stored_enum!(JobState {
    Pending = 0,
    Running = 1,
    Pausing = 2,
    Paused = 3,
    Resuming = 4,
    Exiting = 5,
    Closed = 6,
});

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Closed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Pending, Running) => true,
            (Running, Pausing) => true,
            (Pausing, Paused) => true,
            (Paused, Resuming) => true,
            (Resuming, Running) => true,
            (Exiting, Closed) => true,
            (Closed, _) | (Exiting, _) => false,
            (_, Exiting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a closed job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobReturnCode {
    Success,
    Failed,
    Cancelled,
    Killed,
}

stored_enum!(JobReturnCode {
    Success = 0,
    Failed = 1,
    Cancelled = 2,
    Killed = 3,
});

impl fmt::Display for JobReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Admission priority; higher runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum JobPriority {
    VeryLow,
    Low,
    Normal,
    High,
    VeryHigh,
}

stored_enum!(JobPriority {
    VeryLow = 1,
    Low = 2,
    Normal = 3,
    High = 4,
    VeryHigh = 5,
});

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::Normal
    }
}

/// Ordered severity of a recorded error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Weird,
    Inconvenient,
    NotGood,
    VeryNotGood,
    Bad,
    Catastrophic,
}

stored_enum!(ErrorSeverity {
    Weird = 0,
    Inconvenient = 1,
    NotGood = 2,
    VeryNotGood = 3,
    Bad = 4,
    Catastrophic = 5,
});

/// Top-level classification of a server update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerUpdateType {
    Unknown,
    Database,
    Config,
    Job,
    Artifact,
    Client,
}

stored_enum!(ServerUpdateType {
    Unknown = 0,
    Database = 1,
    Config = 2,
    Job = 3,
    Artifact = 4,
    Client = 5,
});

/// Subtypes of [`ServerUpdateType::Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobUpdateSubtype {
    Unknown,
    StageError,
    ProcessError,
    CommandTimeout,
}

stored_enum!(JobUpdateSubtype {
    Unknown = 0,
    StageError = 1,
    ProcessError = 2,
    CommandTimeout = 3,
});

/// Subtypes of [`ServerUpdateType::Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientUpdateSubtype {
    Unknown,
    Connected,
    Message,
}

stored_enum!(ClientUpdateSubtype {
    Unknown = 0,
    Connected = 1,
    Message = 2,
});
