// ABOUTME: Persistence engine for jobserver: SQLite schema, generic entry storage and query filters.
// ABOUTME: Any type implementing jobserver_core::Entry can be stored, fetched by key and searched.

pub mod database;
pub mod error;
pub mod filter;
pub mod schema;

pub use database::{Database, SetMode};
pub use error::{ErrorKind, StoreError};
pub use filter::{CompareOp, Condition, Filter, Query};
