// ABOUTME: Core library for jobserver: the entry model, persisted record kinds, enumerations and configuration.
// ABOUTME: Every other crate in the workspace builds on these types.

pub mod config;
pub mod entry;
pub mod enums;
pub mod records;
pub mod time;

pub use config::{ConfigClient, ConfigError, ServerConfig};
pub use entry::{Column, ColumnKind, Entry, EntryError, FieldValue, Fields, StoredEnum, Table};
pub use enums::{
    ClientUpdateSubtype, ErrorSeverity, JobPriority, JobReturnCode, JobState, JobUpdateSubtype,
    ServerUpdateType,
};
pub use records::{
    ConnectionRecord, ErrorRecord, JobStatusRecord, JobUpdateRecord, ServerUpdateRecord,
};
pub use time::{MonotonicClock, TimestampInput};
