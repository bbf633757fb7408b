// ABOUTME: Composable search predicates (before/after a time, field comparison) plus pagination and ordering.
// ABOUTME: Filters lower to SQL text built only from declared column names; every value becomes a bound parameter.

use chrono::{DateTime, Utc};
use jobserver_core::{ColumnKind, Entry, FieldValue};
use rusqlite::types::Value;

use crate::error::StoreError;

/// Comparison operators for [`Filter::Compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn as_sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// A single search predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `field < at`; `field` must be a timestamp column.
    Before { field: String, at: DateTime<Utc> },
    /// `field > at`; `field` must be a timestamp column.
    After { field: String, at: DateTime<Utc> },
    Compare {
        field: String,
        op: CompareOp,
        value: FieldValue,
    },
}

impl Filter {
    pub fn before(field: impl Into<String>, at: DateTime<Utc>) -> Self {
        Filter::Before {
            field: field.into(),
            at,
        }
    }

    pub fn after(field: impl Into<String>, at: DateTime<Utc>) -> Self {
        Filter::After {
            field: field.into(),
            at,
        }
    }

    pub fn compare(field: impl Into<String>, op: CompareOp, value: impl Into<FieldValue>) -> Self {
        Filter::Compare {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self::compare(field, CompareOp::Eq, value)
    }

    /// Lower to a bound condition against `E`'s table. The column name is
    /// checked against `E::COLUMNS` and the declared name is what gets
    /// formatted, never the caller's string.
    pub fn condition<E: Entry>(&self) -> Result<Condition, StoreError> {
        match self {
            Filter::Before { field, at } => time_condition::<E>(field, "<", at),
            Filter::After { field, at } => time_condition::<E>(field, ">", at),
            Filter::Compare { field, op, value } => {
                let column = declared::<E>(field)?;
                if *value == FieldValue::Null {
                    let sql = match op {
                        CompareOp::Eq => format!("\"{column}\" IS NULL"),
                        CompareOp::Ne => format!("\"{column}\" IS NOT NULL"),
                        _ => format!("\"{column}\" {} NULL", op.as_sql()),
                    };
                    return Ok(Condition {
                        sql,
                        params: Vec::new(),
                    });
                }
                Ok(Condition {
                    sql: format!("\"{column}\" {} ?", op.as_sql()),
                    params: vec![to_sql_value(value)],
                })
            }
        }
    }
}

fn declared<E: Entry>(field: &str) -> Result<&'static str, StoreError> {
    E::column(field)
        .map(|c| c.name)
        .ok_or_else(|| StoreError::UnknownColumn {
            table: E::TABLE,
            column: field.to_string(),
        })
}

fn time_condition<E: Entry>(
    field: &str,
    op: &str,
    at: &DateTime<Utc>,
) -> Result<Condition, StoreError> {
    let column = E::column(field).ok_or_else(|| StoreError::UnknownColumn {
        table: E::TABLE,
        column: field.to_string(),
    })?;
    if column.kind != ColumnKind::Timestamp {
        return Err(StoreError::NotATimestamp {
            table: E::TABLE,
            column: field.to_string(),
        });
    }
    Ok(Condition {
        sql: format!("\"{}\" {op} ?", column.name),
        params: vec![to_sql_value(&FieldValue::from(at))],
    })
}

/// Predicate text plus the values bound to its placeholders, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub sql: String,
    pub params: Vec<Value>,
}

pub(crate) fn to_sql_value(value: &FieldValue) -> Value {
    match value {
        FieldValue::Null => Value::Null,
        FieldValue::Integer(v) => Value::Integer(*v),
        FieldValue::Real(v) => Value::Real(*v),
        FieldValue::Text(v) => Value::Text(v.clone()),
    }
}

/// A search: filters joined with AND, ordering, and an optional window.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    pub filters: Vec<Filter>,
    /// Maximum rows to return; 0 means unbounded.
    pub limit: u32,
    /// 1-based page number; 0 means unbounded.
    pub page: u32,
    pub descending: bool,
    /// Include large columns (e.g. error tracebacks).
    pub include_large: bool,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Window the result to `limit` rows starting at 1-based `page`.
    pub fn paginate(mut self, limit: u32, page: u32) -> Self {
        self.limit = limit;
        self.page = page;
        self
    }

    pub fn descending(mut self, descending: bool) -> Self {
        self.descending = descending;
        self
    }

    pub fn include_large(mut self, include: bool) -> Self {
        self.include_large = include;
        self
    }

    fn window(&self) -> Option<(i64, i64)> {
        if self.limit == 0 || self.page == 0 {
            return None;
        }
        let limit = i64::from(self.limit);
        Some((limit, (i64::from(self.page) - 1) * limit))
    }

    /// Build the SELECT for `E`. Returns the statement text, the selected
    /// column names (in order), and the bound parameters.
    pub(crate) fn to_select<E: Entry>(
        &self,
    ) -> Result<(String, Vec<&'static str>, Vec<Value>), StoreError> {
        let columns: Vec<&'static str> = E::COLUMNS
            .iter()
            .filter(|c| self.include_large || !c.large)
            .map(|c| c.name)
            .collect();

        let mut sql = format!(
            "SELECT {} FROM \"{}\"",
            quote_all(&columns),
            E::TABLE.as_str()
        );
        let mut params = Vec::new();

        if !self.filters.is_empty() {
            let mut clauses = Vec::with_capacity(self.filters.len());
            for filter in &self.filters {
                let condition = filter.condition::<E>()?;
                clauses.push(condition.sql);
                params.extend(condition.params);
            }
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        let direction = if self.descending { "DESC" } else { "ASC" };
        let order: Vec<String> = E::PRIMARY_KEY
            .iter()
            .map(|pk| format!("\"{pk}\" {direction}"))
            .collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&order.join(", "));

        if let Some((limit, offset)) = self.window() {
            sql.push_str(" LIMIT ? OFFSET ?");
            params.push(Value::Integer(limit));
            params.push(Value::Integer(offset));
        }

        Ok((sql, columns, params))
    }
}

pub(crate) fn quote_all(names: &[&str]) -> String {
    names
        .iter()
        .map(|n| format!("\"{n}\""))
        .collect::<Vec<_>>()
        .join(", ")
}
