// ABOUTME: Schema for the five jobserver tables, with primary keys and foreign-key constraints.
// ABOUTME: Timestamps are INTEGER microseconds, enums INTEGER codes, booleans INTEGER 0/1.

use rusqlite::Connection;

/// Bumped whenever the table definitions change.
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS "Connection" (
    client_token TEXT PRIMARY KEY NOT NULL,
    init_time INTEGER NOT NULL,
    last_message_time INTEGER,
    num_messages INTEGER NOT NULL DEFAULT 0 CHECK (num_messages >= 0),
    client_ip TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS "JobStatus" (
    job_id TEXT PRIMARY KEY NOT NULL,
    init_time INTEGER NOT NULL,
    archived INTEGER NOT NULL DEFAULT 0 CHECK (archived IN (0, 1))
);

CREATE TABLE IF NOT EXISTS "Error" (
    error_id TEXT PRIMARY KEY NOT NULL,
    error_time INTEGER NOT NULL,
    severity_level INTEGER NOT NULL,
    traceback TEXT NOT NULL,
    job_id TEXT REFERENCES "JobStatus"(job_id),
    client_token TEXT REFERENCES "Connection"(client_token)
);

CREATE TABLE IF NOT EXISTS "JobUpdate" (
    job_id TEXT NOT NULL REFERENCES "JobStatus"(job_id),
    update_time INTEGER NOT NULL,
    new_state INTEGER NOT NULL,
    comment TEXT NOT NULL,
    client_token TEXT REFERENCES "Connection"(client_token),
    error_id TEXT REFERENCES "Error"(error_id),
    PRIMARY KEY (job_id, update_time)
);

CREATE TABLE IF NOT EXISTS "ServerUpdate" (
    update_time INTEGER PRIMARY KEY NOT NULL,
    type INTEGER NOT NULL,
    subtype INTEGER NOT NULL,
    comment TEXT NOT NULL,
    job_id TEXT REFERENCES "JobStatus"(job_id),
    client_token TEXT REFERENCES "Connection"(client_token)
);

CREATE INDEX IF NOT EXISTS idx_error_time ON "Error"(error_time);
CREATE INDEX IF NOT EXISTS idx_job_update_time ON "JobUpdate"(update_time);
"#;

/// Create every table that does not exist yet and stamp the schema version.
/// Runs inside one transaction so a crash never leaves half a schema.
pub fn ensure_schema(conn: &mut Connection) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(SCHEMA)?;
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()
}
