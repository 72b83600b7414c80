use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};

use crate::store::SqliteStoreError;

/// Schema version recorded in `store_meta`.
pub const SCHEMA_VERSION: i64 = 1;

const TABLES: &str = "
CREATE TABLE IF NOT EXISTS states (
    guid              TEXT PRIMARY KEY,
    logic_id          TEXT NOT NULL UNIQUE,
    serial            INTEGER NOT NULL DEFAULT 0,
    lineage           TEXT,
    terraform_version TEXT,
    size_bytes        INTEGER NOT NULL DEFAULT 0,
    content           BLOB,
    lock_id           TEXT,
    lock_info         TEXT,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS state_labels (
    state_guid TEXT NOT NULL REFERENCES states(guid) ON DELETE CASCADE,
    key        TEXT NOT NULL,
    value_json TEXT NOT NULL,
    PRIMARY KEY (state_guid, key)
);
CREATE TABLE IF NOT EXISTS output_keys (
    state_guid        TEXT NOT NULL REFERENCES states(guid) ON DELETE CASCADE,
    key               TEXT NOT NULL,
    digest            TEXT,
    sensitive         INTEGER NOT NULL DEFAULT 0,
    schema_json       TEXT,
    schema_source     TEXT,
    validation_status TEXT NOT NULL DEFAULT 'not_validated',
    validation_error  TEXT,
    validated_at      TEXT,
    PRIMARY KEY (state_guid, key)
);
CREATE TABLE IF NOT EXISTS edges (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    from_guid       TEXT NOT NULL,
    from_output     TEXT NOT NULL,
    to_guid         TEXT NOT NULL,
    to_input_name   TEXT NOT NULL,
    status          TEXT NOT NULL,
    in_digest       TEXT,
    out_digest      TEXT,
    mock_value_json TEXT,
    last_in_at      TEXT,
    last_out_at     TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    UNIQUE (from_guid, from_output, to_guid, to_input_name)
);
CREATE INDEX IF NOT EXISTS idx_edges_from ON edges (from_guid);
CREATE INDEX IF NOT EXISTS idx_edges_to ON edges (to_guid);
";

/// Connection pragmas. WAL is skipped for in-memory databases.
pub(crate) fn apply_pragmas(
    conn: &Connection,
    busy_timeout_ms: u64,
    wal: bool,
) -> Result<(), SqliteStoreError> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    if wal {
        conn.execute_batch("PRAGMA journal_mode = wal;")?;
        conn.execute_batch("PRAGMA synchronous = normal;")?;
    }
    conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
    Ok(())
}

/// Create tables on a fresh database, or check the version of an existing one.
pub(crate) fn initialize(conn: &mut Connection) -> Result<(), SqliteStoreError> {
    let tx = conn.transaction()?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM store_meta LIMIT 1", params![], |row| {
            row.get(0)
        })
        .optional()?;
    match version {
        None => {
            tx.execute(
                "INSERT INTO store_meta (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
            tx.execute_batch(TABLES)?;
        }
        Some(v) if v == SCHEMA_VERSION => {}
        Some(v) => return Err(SqliteStoreError::VersionMismatch(v)),
    }
    tx.commit()?;
    Ok(())
}
