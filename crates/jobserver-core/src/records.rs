// ABOUTME: The five persisted record kinds: connections, errors, job statuses, job updates and server updates.
// ABOUTME: Each implements Entry with a static column list, so one generic code path can store all of them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entry::{Column, ColumnKind, Entry, EntryError, FieldValue, Fields, StoredEnum, Table};
use crate::enums::{ErrorSeverity, JobState, ServerUpdateType};
use crate::time;

/// A client that has talked to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub client_token: String,
    pub init_time: DateTime<Utc>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub num_messages: i64,
    pub client_ip: String,
}

impl ConnectionRecord {
    pub fn new(client_token: impl Into<String>, client_ip: impl Into<String>) -> Self {
        Self {
            client_token: client_token.into(),
            init_time: time::now(),
            last_message_time: None,
            num_messages: 0,
            client_ip: client_ip.into(),
        }
    }

    /// Count one more message from this client.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.num_messages += 1;
        self.last_message_time = Some(time::truncate(at));
    }
}

impl Entry for ConnectionRecord {
    const TABLE: Table = Table::Connection;
    const PRIMARY_KEY: &'static [&'static str] = &["client_token"];
    const COLUMNS: &'static [Column] = &[
        Column::new("client_token", ColumnKind::Text),
        Column::new("init_time", ColumnKind::Timestamp),
        Column::new("last_message_time", ColumnKind::Timestamp),
        Column::new("num_messages", ColumnKind::Integer),
        Column::new("client_ip", ColumnKind::Text),
    ];

    fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("client_token", self.client_token.as_str().into()),
            ("init_time", self.init_time.into()),
            ("last_message_time", self.last_message_time.into()),
            ("num_messages", self.num_messages.into()),
            ("client_ip", self.client_ip.as_str().into()),
        ]
    }

    fn from_fields(fields: &Fields) -> Result<Self, EntryError> {
        Ok(Self {
            client_token: fields.text("client_token")?,
            init_time: fields.timestamp("init_time")?,
            last_message_time: fields.opt_timestamp("last_message_time")?,
            num_messages: fields.integer("num_messages")?,
            client_ip: fields.text("client_ip")?,
        })
    }
}

/// A recorded failure, optionally tied to a job and/or a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub error_id: String,
    pub error_time: DateTime<Utc>,
    pub severity_level: ErrorSeverity,
    pub traceback: String,
    pub job_id: Option<String>,
    pub client_token: Option<String>,
}

impl ErrorRecord {
    pub fn new(
        error_id: impl Into<String>,
        severity_level: ErrorSeverity,
        traceback: impl Into<String>,
    ) -> Self {
        Self {
            error_id: error_id.into(),
            error_time: time::now(),
            severity_level,
            traceback: traceback.into(),
            job_id: None,
            client_token: None,
        }
    }

    pub fn for_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn for_client(mut self, client_token: impl Into<String>) -> Self {
        self.client_token = Some(client_token.into());
        self
    }
}

impl Entry for ErrorRecord {
    const TABLE: Table = Table::Error;
    const PRIMARY_KEY: &'static [&'static str] = &["error_id"];
    const COLUMNS: &'static [Column] = &[
        Column::new("error_id", ColumnKind::Text),
        Column::new("error_time", ColumnKind::Timestamp),
        Column::new("severity_level", ColumnKind::Enum),
        Column::large("traceback", ColumnKind::Text),
        Column::new("job_id", ColumnKind::Text),
        Column::new("client_token", ColumnKind::Text),
    ];

    fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("error_id", self.error_id.as_str().into()),
            ("error_time", self.error_time.into()),
            ("severity_level", self.severity_level.code().into()),
            ("traceback", self.traceback.as_str().into()),
            ("job_id", self.job_id.as_deref().into()),
            ("client_token", self.client_token.as_deref().into()),
        ]
    }

    fn from_fields(fields: &Fields) -> Result<Self, EntryError> {
        Ok(Self {
            error_id: fields.text("error_id")?,
            error_time: fields.timestamp("error_time")?,
            severity_level: fields.code("severity_level")?,
            // Left out of bulk searches unless asked for.
            traceback: fields.opt_text("traceback")?.unwrap_or_default(),
            job_id: fields.opt_text("job_id")?,
            client_token: fields.opt_text("client_token")?,
        })
    }
}

/// The durable identity of a job. Owned by the job manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusRecord {
    pub job_id: String,
    pub init_time: DateTime<Utc>,
    pub archived: bool,
}

impl JobStatusRecord {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            init_time: time::now(),
            archived: false,
        }
    }
}

impl Entry for JobStatusRecord {
    const TABLE: Table = Table::JobStatus;
    const PRIMARY_KEY: &'static [&'static str] = &["job_id"];
    const COLUMNS: &'static [Column] = &[
        Column::new("job_id", ColumnKind::Text),
        Column::new("init_time", ColumnKind::Timestamp),
        Column::new("archived", ColumnKind::Boolean),
    ];

    fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("job_id", self.job_id.as_str().into()),
            ("init_time", self.init_time.into()),
            ("archived", self.archived.into()),
        ]
    }

    fn from_fields(fields: &Fields) -> Result<Self, EntryError> {
        Ok(Self {
            job_id: fields.text("job_id")?,
            init_time: fields.timestamp("init_time")?,
            archived: fields.boolean("archived")?,
        })
    }
}

/// One transition in a job's append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobUpdateRecord {
    pub job_id: String,
    pub update_time: DateTime<Utc>,
    pub new_state: i64,
    pub comment: String,
    pub client_token: Option<String>,
    pub error_id: Option<String>,
}

impl JobUpdateRecord {
    pub fn new(
        job_id: impl Into<String>,
        update_time: DateTime<Utc>,
        state: JobState,
        comment: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            update_time: time::truncate(update_time),
            new_state: state.code(),
            comment: comment.into(),
            client_token: None,
            error_id: None,
        }
    }

    /// The state this update moved the job into, if the code is known.
    pub fn state(&self) -> Option<JobState> {
        JobState::from_code(self.new_state)
    }
}

impl Entry for JobUpdateRecord {
    const TABLE: Table = Table::JobUpdate;
    const PRIMARY_KEY: &'static [&'static str] = &["job_id", "update_time"];
    const COLUMNS: &'static [Column] = &[
        Column::new("job_id", ColumnKind::Text),
        Column::new("update_time", ColumnKind::Timestamp),
        Column::new("new_state", ColumnKind::Integer),
        Column::new("comment", ColumnKind::Text),
        Column::new("client_token", ColumnKind::Text),
        Column::new("error_id", ColumnKind::Text),
    ];

    fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("job_id", self.job_id.as_str().into()),
            ("update_time", self.update_time.into()),
            ("new_state", self.new_state.into()),
            ("comment", self.comment.as_str().into()),
            ("client_token", self.client_token.as_deref().into()),
            ("error_id", self.error_id.as_deref().into()),
        ]
    }

    fn from_fields(fields: &Fields) -> Result<Self, EntryError> {
        Ok(Self {
            job_id: fields.text("job_id")?,
            update_time: fields.timestamp("update_time")?,
            new_state: fields.integer("new_state")?,
            comment: fields.text("comment")?,
            client_token: fields.opt_text("client_token")?,
            error_id: fields.opt_text("error_id")?,
        })
    }
}

/// A server-wide notice, keyed on its timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerUpdateRecord {
    pub update_time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub update_type: ServerUpdateType,
    pub subtype: i64,
    pub comment: String,
    pub job_id: Option<String>,
    pub client_token: Option<String>,
}

impl ServerUpdateRecord {
    pub fn new(
        update_time: DateTime<Utc>,
        update_type: ServerUpdateType,
        subtype: impl StoredEnum,
        comment: impl Into<String>,
    ) -> Self {
        Self {
            update_time: time::truncate(update_time),
            update_type,
            subtype: subtype.code(),
            comment: comment.into(),
            job_id: None,
            client_token: None,
        }
    }

    pub fn for_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn for_client(mut self, client_token: impl Into<String>) -> Self {
        self.client_token = Some(client_token.into());
        self
    }
}

impl Entry for ServerUpdateRecord {
    const TABLE: Table = Table::ServerUpdate;
    const PRIMARY_KEY: &'static [&'static str] = &["update_time"];
    const COLUMNS: &'static [Column] = &[
        Column::new("update_time", ColumnKind::Timestamp),
        Column::new("type", ColumnKind::Enum),
        Column::new("subtype", ColumnKind::Integer),
        Column::new("comment", ColumnKind::Text),
        Column::new("job_id", ColumnKind::Text),
        Column::new("client_token", ColumnKind::Text),
    ];

    fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("update_time", self.update_time.into()),
            ("type", self.update_type.code().into()),
            ("subtype", self.subtype.into()),
            ("comment", self.comment.as_str().into()),
            ("job_id", self.job_id.as_deref().into()),
            ("client_token", self.client_token.as_deref().into()),
        ]
    }

    fn from_fields(fields: &Fields) -> Result<Self, EntryError> {
        Ok(Self {
            update_time: fields.timestamp("update_time")?,
            update_type: fields.code("type")?,
            subtype: fields.integer("subtype")?,
            comment: fields.text("comment")?,
            job_id: fields.opt_text("job_id")?,
            client_token: fields.opt_text("client_token")?,
        })
    }
}
