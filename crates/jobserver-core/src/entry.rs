// ABOUTME: The Entry contract: static table/column declarations plus explicit field extraction and rebuilding.
// ABOUTME: Defines FieldValue (the storable primitives), Fields (a decoded row) and EntryError.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::time::{from_micros, to_micros};

/// Errors raised while extracting or rebuilding entry fields.
#[derive(Debug, Error, PartialEq)]
pub enum EntryError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("field {field} has the wrong type, expected {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("field {field} holds unknown code {code}")]
    UnknownCode { field: &'static str, code: i64 },
}

/// The tables the store knows about. This is a closed set: table names are
/// formatted into SQL, so nothing outside this enum may become one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Table {
    Connection,
    Error,
    JobStatus,
    JobUpdate,
    ServerUpdate,
}

impl Table {
    pub const ALL: [Table; 5] = [
        Table::Connection,
        Table::Error,
        Table::JobStatus,
        Table::JobUpdate,
        Table::ServerUpdate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Connection => "Connection",
            Table::Error => "Error",
            Table::JobStatus => "JobStatus",
            Table::JobUpdate => "JobUpdate",
            Table::ServerUpdate => "ServerUpdate",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a column is encoded in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    Real,
    Boolean,
    /// Microseconds since the epoch.
    Timestamp,
    /// Integer code of a [`StoredEnum`].
    Enum,
}

/// A statically declared column of an entry's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
    /// Large columns are left out of bulk searches unless requested.
    pub large: bool,
}

impl Column {
    pub const fn new(name: &'static str, kind: ColumnKind) -> Self {
        Self {
            name,
            kind,
            large: false,
        }
    }

    pub const fn large(name: &'static str, kind: ColumnKind) -> Self {
        Self {
            name,
            kind,
            large: true,
        }
    }
}

/// A storable primitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Real(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Integer(v as i64)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(v: DateTime<Utc>) -> Self {
        FieldValue::Integer(to_micros(&v))
    }
}

impl From<&DateTime<Utc>> for FieldValue {
    fn from(v: &DateTime<Utc>) -> Self {
        FieldValue::Integer(to_micros(v))
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// An enumeration persisted as its integer code.
pub trait StoredEnum: Sized + Copy {
    fn code(&self) -> i64;
    fn from_code(code: i64) -> Option<Self>;
}

/// A decoded row: column name to stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fields {
    values: BTreeMap<&'static str, FieldValue>,
}

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &'static str, value: FieldValue) {
        self.values.insert(name, value);
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.values.get(name)
    }

    fn present(&self, name: &'static str) -> Option<&FieldValue> {
        match self.values.get(name) {
            None | Some(FieldValue::Null) => None,
            Some(v) => Some(v),
        }
    }

    pub fn text(&self, name: &'static str) -> Result<String, EntryError> {
        self.opt_text(name)?.ok_or(EntryError::MissingField(name))
    }

    /// Null and absent both read as `None`; absent happens when a large
    /// column was left out of a search.
    pub fn opt_text(&self, name: &'static str) -> Result<Option<String>, EntryError> {
        match self.present(name) {
            None => Ok(None),
            Some(FieldValue::Text(s)) => Ok(Some(s.clone())),
            Some(_) => Err(EntryError::WrongType {
                field: name,
                expected: "text",
            }),
        }
    }

    pub fn integer(&self, name: &'static str) -> Result<i64, EntryError> {
        self.opt_integer(name)?.ok_or(EntryError::MissingField(name))
    }

    pub fn opt_integer(&self, name: &'static str) -> Result<Option<i64>, EntryError> {
        match self.present(name) {
            None => Ok(None),
            Some(FieldValue::Integer(v)) => Ok(Some(*v)),
            Some(_) => Err(EntryError::WrongType {
                field: name,
                expected: "integer",
            }),
        }
    }

    pub fn boolean(&self, name: &'static str) -> Result<bool, EntryError> {
        Ok(self.integer(name)? != 0)
    }

    pub fn timestamp(&self, name: &'static str) -> Result<DateTime<Utc>, EntryError> {
        from_micros(self.integer(name)?)
    }

    pub fn opt_timestamp(&self, name: &'static str) -> Result<Option<DateTime<Utc>>, EntryError> {
        self.opt_integer(name)?.map(from_micros).transpose()
    }

    pub fn code<E: StoredEnum>(&self, name: &'static str) -> Result<E, EntryError> {
        let code = self.integer(name)?;
        E::from_code(code).ok_or(EntryError::UnknownCode { field: name, code })
    }
}

impl FromIterator<(&'static str, FieldValue)> for Fields {
    fn from_iter<I: IntoIterator<Item = (&'static str, FieldValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// A record the persistence engine can store.
///
/// Implementors declare their table, primary key and columns statically and
/// convert to and from [`Fields`] by hand. `fields()` must yield exactly the
/// declared columns, in declaration order.
pub trait Entry: Sized + Send + Sync + 'static {
    const TABLE: Table;
    const PRIMARY_KEY: &'static [&'static str];
    const COLUMNS: &'static [Column];

    fn fields(&self) -> Vec<(&'static str, FieldValue)>;

    fn from_fields(fields: &Fields) -> Result<Self, EntryError>;

    fn column(name: &str) -> Option<&'static Column> {
        Self::COLUMNS.iter().find(|c| c.name == name)
    }

    /// The primary key values of this entry, in key order.
    fn key(&self) -> Vec<FieldValue> {
        let fields = self.fields();
        Self::PRIMARY_KEY
            .iter()
            .filter_map(|pk| {
                fields
                    .iter()
                    .find(|(name, _)| name == pk)
                    .map(|(_, v)| v.clone())
            })
            .collect()
    }
}
