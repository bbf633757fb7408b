// ABOUTME: SQLite-backed persistence engine: connect, generic point get/set and filtered search over any Entry.
// ABOUTME: One connection behind a mutex; every write runs in its own transaction with all values bound.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use jobserver_core::{Entry, FieldValue, Fields};
use rusqlite::types::Value;
use rusqlite::{Connection, Row, params_from_iter};

use crate::error::StoreError;
use crate::filter::{Query, quote_all, to_sql_value};
use crate::schema::ensure_schema;

/// How [`Database::set_entry`] treats an existing row with the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    /// Fail with `ConstraintViolation` if the key exists.
    Insert,
    /// Fail with `NotFound` if the key does not exist.
    Update,
    /// Insert, or overwrite the non-key columns of the existing row.
    Upsert,
}

/// The persistence engine. Cheap to share behind an `Arc`.
pub struct Database {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl Database {
    /// Open the store at `path`, creating the file and tables when
    /// `create_if_missing` is set. A missing file without it is
    /// `StoreNotFound`.
    pub fn connect(path: &Path, create_if_missing: bool) -> Result<Self, StoreError> {
        if !path.exists() && !create_if_missing {
            return Err(StoreError::StoreNotFound(path.to_path_buf()));
        }

        let mut conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        ensure_schema(&mut conn)?;

        tracing::info!(path = %path.display(), "connected to store");
        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(Some(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_connected(&self) -> bool {
        self.lock().is_some()
    }

    /// Close the connection. Safe to call more than once; every later
    /// operation fails with `Disconnected`.
    pub fn disconnect(&self) -> Result<(), StoreError> {
        let Some(conn) = self.lock().take() else {
            return Ok(());
        };
        conn.close().map_err(|(_, err)| StoreError::Sqlite(err))?;
        tracing::info!(path = %self.path.display(), "disconnected from store");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        // A panic mid-operation leaves the connection usable; the
        // transaction it held was rolled back on drop.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.lock();
        let conn = guard.as_mut().ok_or(StoreError::Disconnected)?;
        f(conn)
    }

    /// Write `entry` according to `mode`, in one transaction.
    pub fn set_entry<E: Entry>(&self, entry: &E, mode: SetMode) -> Result<(), StoreError> {
        let fields = entry.fields();
        for (name, _) in &fields {
            if E::column(name).is_none() {
                return Err(StoreError::UnknownColumn {
                    table: E::TABLE,
                    column: name.to_string(),
                });
            }
        }

        let (sql, params) = match mode {
            SetMode::Insert => insert_sql::<E>(&fields, None),
            SetMode::Upsert => insert_sql::<E>(&fields, Some(E::PRIMARY_KEY)),
            SetMode::Update => update_sql::<E>(&fields),
        };

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let changed = tx
                .execute(&sql, params_from_iter(params))
                .map_err(|e| StoreError::from_write(E::TABLE, e))?;
            if mode == SetMode::Update && changed == 0 {
                return Err(StoreError::NotFound {
                    table: E::TABLE,
                    key: describe_key(&entry.key()),
                });
            }
            tx.commit()?;
            tracing::debug!(table = %E::TABLE, ?mode, "entry written");
            Ok(())
        })
    }

    /// Fetch the entry whose primary key equals `key` (values in key order).
    pub fn get_entry<E: Entry>(&self, key: &[FieldValue]) -> Result<Option<E>, StoreError> {
        if key.len() != E::PRIMARY_KEY.len() {
            return Err(StoreError::KeyArity {
                table: E::TABLE,
                expected: E::PRIMARY_KEY.len(),
                got: key.len(),
            });
        }

        let columns: Vec<&'static str> = E::COLUMNS.iter().map(|c| c.name).collect();
        let predicate: Vec<String> = E::PRIMARY_KEY
            .iter()
            .map(|pk| format!("\"{pk}\" = ?"))
            .collect();
        let sql = format!(
            "SELECT {} FROM \"{}\" WHERE {}",
            quote_all(&columns),
            E::TABLE.as_str(),
            predicate.join(" AND ")
        );
        let params: Vec<Value> = key.iter().map(to_sql_value).collect();

        let mut rows = self.fetch(&sql, &columns, params)?;
        match rows.len() {
            0 => Ok(None),
            1 => Ok(Some(E::from_fields(&rows.remove(0))?)),
            matches => {
                let key = describe_key(key);
                tracing::error!(
                    table = %E::TABLE,
                    %key,
                    matches,
                    "primary key matched more than one row"
                );
                Err(StoreError::ConsistencyFault {
                    table: E::TABLE,
                    key,
                    matches,
                })
            }
        }
    }

    /// All entries matching every filter in `query`, ordered by primary key.
    pub fn search_entries<E: Entry>(&self, query: &Query) -> Result<Vec<E>, StoreError> {
        let (sql, columns, params) = query.to_select::<E>()?;
        let rows = self.fetch(&sql, &columns, params)?;
        rows.iter()
            .map(|fields| E::from_fields(fields).map_err(StoreError::from))
            .collect()
    }

    fn fetch(
        &self,
        sql: &str,
        columns: &[&'static str],
        params: Vec<Value>,
    ) -> Result<Vec<Fields>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map(params_from_iter(params), |row| read_row(row, columns))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(err) = self.disconnect() {
            tracing::warn!("failed to close store cleanly: {}", err);
        }
    }
}

fn read_row(row: &Row<'_>, columns: &[&'static str]) -> rusqlite::Result<Fields> {
    let mut fields = Fields::new();
    for (i, name) in columns.iter().enumerate() {
        let value = match row.get::<_, Value>(i)? {
            Value::Null => FieldValue::Null,
            Value::Integer(v) => FieldValue::Integer(v),
            Value::Real(v) => FieldValue::Real(v),
            Value::Text(v) => FieldValue::Text(v),
            Value::Blob(v) => FieldValue::Text(String::from_utf8_lossy(&v).into_owned()),
        };
        fields.insert(*name, value);
    }
    Ok(fields)
}

fn insert_sql<E: Entry>(
    fields: &[(&'static str, FieldValue)],
    conflict_key: Option<&[&str]>,
) -> (String, Vec<Value>) {
    let names: Vec<&str> = fields.iter().map(|(n, _)| *n).collect();
    let placeholders = vec!["?"; names.len()].join(", ");
    let mut sql = format!(
        "INSERT INTO \"{}\" ({}) VALUES ({})",
        E::TABLE.as_str(),
        quote_all(&names),
        placeholders
    );

    if let Some(key) = conflict_key {
        let updates: Vec<String> = names
            .iter()
            .filter(|n| !key.contains(*n))
            .map(|n| format!("\"{n}\" = excluded.\"{n}\""))
            .collect();
        sql.push_str(&format!(" ON CONFLICT ({}) ", quote_all(key)));
        if updates.is_empty() {
            sql.push_str("DO NOTHING");
        } else {
            sql.push_str("DO UPDATE SET ");
            sql.push_str(&updates.join(", "));
        }
    }

    let params = fields.iter().map(|(_, v)| to_sql_value(v)).collect();
    (sql, params)
}

fn update_sql<E: Entry>(fields: &[(&'static str, FieldValue)]) -> (String, Vec<Value>) {
    let is_key = |name: &str| E::PRIMARY_KEY.contains(&name);

    let mut assigned: Vec<&(&'static str, FieldValue)> =
        fields.iter().filter(|(n, _)| !is_key(*n)).collect();
    if assigned.is_empty() {
        assigned = fields.iter().collect();
    }
    let keyed: Vec<&(&'static str, FieldValue)> = E::PRIMARY_KEY
        .iter()
        .filter_map(|pk| fields.iter().find(|(n, _)| n == pk))
        .collect();

    let set: Vec<String> = assigned
        .iter()
        .map(|(n, _)| format!("\"{n}\" = ?"))
        .collect();
    let predicate: Vec<String> = keyed.iter().map(|(n, _)| format!("\"{n}\" = ?")).collect();
    let sql = format!(
        "UPDATE \"{}\" SET {} WHERE {}",
        E::TABLE.as_str(),
        set.join(", "),
        predicate.join(" AND ")
    );

    let params = assigned
        .iter()
        .chain(keyed.iter())
        .map(|(_, v)| to_sql_value(v))
        .collect();
    (sql, params)
}

fn describe_key(key: &[FieldValue]) -> String {
    key.iter()
        .map(|v| match v {
            FieldValue::Null => "null".to_string(),
            FieldValue::Integer(i) => i.to_string(),
            FieldValue::Real(r) => r.to_string(),
            FieldValue::Text(s) => s.clone(),
        })
        .collect::<Vec<_>>()
        .join("/")
}
