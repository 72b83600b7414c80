use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior,
};
use serde::Deserialize;
use stategraph_storage::{
    ContentUpdate, EdgeRecord, EdgeStatus, EdgeStore, EdgeUpdate, LabelValue, Labels, LockInfo,
    NewEdge, NewState, OutputKeyRecord, SchemaSource, StateQuery, StateRecord, StateStore,
    StorageError, ValidationStatus,
};

use crate::schema;

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Where and how to open the database file.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteStoreConfig {
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

impl SqliteStoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

/// Errors raised while opening or initializing the database.
#[derive(Debug, thiserror::Error)]
pub enum SqliteStoreError {
    #[error("sqlite store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite store db error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("sqlite store has schema version {0}, expected {expected}", expected = schema::SCHEMA_VERSION)]
    VersionMismatch(i64),
    #[error("invalid store path: {0}")]
    InvalidPath(String),
}

/// `StateStore` + `EdgeStore` over a single SQLite connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `config.path`.
    pub fn open(config: &SqliteStoreConfig) -> Result<Self, SqliteStoreError> {
        validate_path(&config.path)?;
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut conn = Connection::open(&config.path)?;
        schema::apply_pragmas(&conn, config.busy_timeout_ms, true)?;
        schema::initialize(&mut conn)?;
        tracing::debug!(path = %config.path.display(), "opened sqlite store");
        Ok(Self::from_connection(conn))
    }

    /// Private in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, SqliteStoreError> {
        let mut conn = Connection::open_in_memory()?;
        schema::apply_pragmas(&conn, DEFAULT_BUSY_TIMEOUT_MS, false)?;
        schema::initialize(&mut conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `f` against the connection on a blocking worker.
    async fn run<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StorageError::Backend("connection mutex poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Backend(format!("blocking task failed: {e}")))?
    }
}

fn validate_path(path: &Path) -> Result<(), SqliteStoreError> {
    if path.as_os_str().is_empty() {
        return Err(SqliteStoreError::InvalidPath("path is empty".to_string()));
    }
    if path.is_dir() {
        return Err(SqliteStoreError::InvalidPath(format!(
            "{} is a directory",
            path.display()
        )));
    }
    Ok(())
}

fn db(err: rusqlite::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

fn immediate(conn: &mut Connection) -> Result<rusqlite::Transaction<'_>, StorageError> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(db)
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

// ── Row mapping ───────────────────────────────────────────────────────────────

const STATE_COLUMNS: &str = "guid, logic_id, serial, lineage, terraform_version, size_bytes, \
                             lock_info, created_at, updated_at";

struct StateRow {
    guid: String,
    logic_id: String,
    serial: i64,
    lineage: Option<String>,
    terraform_version: Option<String>,
    size_bytes: i64,
    lock_info: Option<String>,
    created_at: String,
    updated_at: String,
}

fn read_state_row(row: &Row<'_>) -> rusqlite::Result<StateRow> {
    Ok(StateRow {
        guid: row.get(0)?,
        logic_id: row.get(1)?,
        serial: row.get(2)?,
        lineage: row.get(3)?,
        terraform_version: row.get(4)?,
        size_bytes: row.get(5)?,
        lock_info: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn load_labels(conn: &Connection, guid: &str) -> Result<Labels, StorageError> {
    let mut stmt = conn
        .prepare("SELECT key, value_json FROM state_labels WHERE state_guid = ?1")
        .map_err(db)?;
    let rows = stmt
        .query_map(params![guid], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(db)?;
    let mut labels = Labels::new();
    for row in rows {
        let (key, value_json) = row.map_err(db)?;
        let value: LabelValue = serde_json::from_str(&value_json)
            .map_err(|e| StorageError::Backend(format!("corrupt label '{key}': {e}")))?;
        labels.insert(key, value);
    }
    Ok(labels)
}

fn write_labels(conn: &Connection, guid: &str, labels: &Labels) -> Result<(), StorageError> {
    conn.execute("DELETE FROM state_labels WHERE state_guid = ?1", params![guid])
        .map_err(db)?;
    let mut stmt = conn
        .prepare("INSERT INTO state_labels (state_guid, key, value_json) VALUES (?1, ?2, ?3)")
        .map_err(db)?;
    for (key, value) in labels {
        stmt.execute(params![guid, key, value.to_json_text()])
            .map_err(db)?;
    }
    Ok(())
}

fn hydrate_state(conn: &Connection, row: StateRow) -> Result<StateRecord, StorageError> {
    let lock = row
        .lock_info
        .as_deref()
        .map(serde_json::from_str::<LockInfo>)
        .transpose()
        .map_err(|e| StorageError::Backend(format!("corrupt lock info on {}: {e}", row.guid)))?;
    let labels = load_labels(conn, &row.guid)?;
    Ok(StateRecord {
        guid: row.guid,
        logic_id: row.logic_id,
        serial: row.serial,
        lineage: row.lineage,
        terraform_version: row.terraform_version,
        size_bytes: row.size_bytes,
        labels,
        lock,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

fn find_state(conn: &Connection, guid: &str) -> Result<Option<StateRecord>, StorageError> {
    let row = conn
        .query_row(
            &format!("SELECT {STATE_COLUMNS} FROM states WHERE guid = ?1"),
            params![guid],
            read_state_row,
        )
        .optional()
        .map_err(db)?;
    row.map(|r| hydrate_state(conn, r)).transpose()
}

fn load_state(conn: &Connection, guid: &str) -> Result<StateRecord, StorageError> {
    find_state(conn, guid)?.ok_or_else(|| StorageError::StateNotFound {
        guid: guid.to_string(),
    })
}

fn ensure_state(conn: &Connection, guid: &str) -> Result<(), StorageError> {
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM states WHERE guid = ?1", params![guid], |row| {
            row.get(0)
        })
        .optional()
        .map_err(db)?;
    match exists {
        Some(_) => Ok(()),
        None => Err(StorageError::StateNotFound {
            guid: guid.to_string(),
        }),
    }
}

const OUTPUT_COLUMNS: &str = "state_guid, key, digest, sensitive, schema_json, schema_source, \
                              validation_status, validation_error, validated_at";

fn load_outputs(conn: &Connection, guid: &str) -> Result<Vec<OutputKeyRecord>, StorageError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {OUTPUT_COLUMNS} FROM output_keys WHERE state_guid = ?1 ORDER BY key"
        ))
        .map_err(db)?;
    let rows = stmt.query_map(params![guid], read_output).map_err(db)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(db)
}

fn read_output(row: &Row<'_>) -> rusqlite::Result<OutputKeyRecord> {
    let schema_source = row
        .get::<_, Option<String>>(5)?
        .map(|s| s.parse::<SchemaSource>())
        .transpose()
        .map_err(|e| conversion_error(5, e))?;
    let validation_status = row
        .get::<_, String>(6)?
        .parse::<ValidationStatus>()
        .map_err(|e| conversion_error(6, e))?;
    Ok(OutputKeyRecord {
        state_guid: row.get(0)?,
        key: row.get(1)?,
        digest: row.get(2)?,
        sensitive: row.get(3)?,
        schema_json: row.get(4)?,
        schema_source,
        validation_status,
        validation_error: row.get(7)?,
        validated_at: row.get(8)?,
    })
}

fn load_output(conn: &Connection, guid: &str, key: &str) -> Result<OutputKeyRecord, StorageError> {
    conn.query_row(
        &format!("SELECT {OUTPUT_COLUMNS} FROM output_keys WHERE state_guid = ?1 AND key = ?2"),
        params![guid, key],
        read_output,
    )
    .map_err(db)
}

const EDGE_COLUMNS: &str = "id, from_guid, from_output, to_guid, to_input_name, status, \
                            in_digest, out_digest, mock_value_json, last_in_at, last_out_at, \
                            created_at, updated_at";

fn read_edge(row: &Row<'_>) -> rusqlite::Result<EdgeRecord> {
    let status = row
        .get::<_, String>(5)?
        .parse::<EdgeStatus>()
        .map_err(|e| conversion_error(5, e))?;
    Ok(EdgeRecord {
        id: row.get(0)?,
        from_guid: row.get(1)?,
        from_output: row.get(2)?,
        to_guid: row.get(3)?,
        to_input_name: row.get(4)?,
        status,
        in_digest: row.get(6)?,
        out_digest: row.get(7)?,
        mock_value_json: row.get(8)?,
        last_in_at: row.get(9)?,
        last_out_at: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn load_edge(conn: &Connection, id: i64) -> Result<EdgeRecord, StorageError> {
    conn.query_row(
        &format!("SELECT {EDGE_COLUMNS} FROM edges WHERE id = ?1"),
        params![id],
        read_edge,
    )
    .optional()
    .map_err(db)?
    .ok_or(StorageError::EdgeNotFound { id })
}

fn list_edges_where(
    conn: &Connection,
    column: &str,
    guid: &str,
) -> Result<Vec<EdgeRecord>, StorageError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {EDGE_COLUMNS} FROM edges WHERE {column} = ?1 ORDER BY id"
        ))
        .map_err(db)?;
    let rows = stmt.query_map(params![guid], read_edge).map_err(db)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(db)
}

// ── StateStore ────────────────────────────────────────────────────────────────

#[async_trait]
impl StateStore for SqliteStore {
    async fn create_state(&self, state: NewState) -> Result<StateRecord, StorageError> {
        self.run(move |conn| {
            let tx = immediate(conn)?;
            if find_state(&tx, &state.guid)?.is_some() {
                return Err(StorageError::AlreadyExists {
                    field: "guid".to_string(),
                    value: state.guid,
                });
            }
            let taken: Option<String> = tx
                .query_row(
                    "SELECT guid FROM states WHERE logic_id = ?1",
                    params![state.logic_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db)?;
            if taken.is_some() {
                return Err(StorageError::AlreadyExists {
                    field: "logic_id".to_string(),
                    value: state.logic_id,
                });
            }
            tx.execute(
                "INSERT INTO states (guid, logic_id, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?3)",
                params![state.guid, state.logic_id, state.created_at],
            )
            .map_err(db)?;
            write_labels(&tx, &state.guid, &state.labels)?;
            let record = load_state(&tx, &state.guid)?;
            tx.commit().map_err(db)?;
            Ok(record)
        })
        .await
    }

    async fn get_state(&self, guid: &str) -> Result<StateRecord, StorageError> {
        let guid = guid.to_string();
        self.run(move |conn| load_state(conn, &guid)).await
    }

    async fn get_state_by_logic_id(&self, logic_id: &str) -> Result<StateRecord, StorageError> {
        let logic_id = logic_id.to_string();
        self.run(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {STATE_COLUMNS} FROM states WHERE logic_id = ?1"),
                    params![logic_id],
                    read_state_row,
                )
                .optional()
                .map_err(db)?;
            match row {
                Some(row) => hydrate_state(conn, row),
                None => Err(StorageError::LogicIdNotFound { logic_id }),
            }
        })
        .await
    }

    async fn list_states(&self, query: &StateQuery) -> Result<Vec<StateRecord>, StorageError> {
        let query = query.clone();
        self.run(move |conn| {
            let conn: &Connection = conn;
            let mut sql = format!("SELECT {STATE_COLUMNS} FROM states WHERE 1 = 1");
            let mut args: Vec<String> = Vec::new();
            if let Some(after) = &query.after_guid {
                args.push(after.clone());
                sql.push_str(&format!(" AND guid > ?{}", args.len()));
            }
            if let Some(prefix) = &query.logic_id_prefix {
                args.push(prefix.clone());
                let n = args.len();
                sql.push_str(&format!(" AND substr(logic_id, 1, length(?{n})) = ?{n}"));
            }
            for (key, value) in &query.labels {
                args.push(key.clone());
                args.push(value.to_json_text());
                let (k, v) = (args.len() - 1, args.len());
                sql.push_str(&format!(
                    " AND EXISTS (SELECT 1 FROM state_labels l WHERE l.state_guid = states.guid \
                     AND l.key = ?{k} AND l.value_json = ?{v})"
                ));
            }
            sql.push_str(" ORDER BY guid");
            if query.limit > 0 {
                sql.push_str(&format!(" LIMIT {}", query.limit));
            }

            let rows = {
                let mut stmt = conn.prepare(&sql).map_err(db)?;
                let mapped = stmt
                    .query_map(params_from_iter(args.iter()), read_state_row)
                    .map_err(db)?;
                mapped.collect::<Result<Vec<_>, _>>().map_err(db)?
            };
            rows.into_iter().map(|r| hydrate_state(conn, r)).collect()
        })
        .await
    }

    async fn get_content(&self, guid: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let guid = guid.to_string();
        self.run(move |conn| {
            let content: Option<Option<Vec<u8>>> = conn
                .query_row(
                    "SELECT content FROM states WHERE guid = ?1",
                    params![guid],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db)?;
            content.ok_or(StorageError::StateNotFound { guid })
        })
        .await
    }

    async fn update_content(
        &self,
        guid: &str,
        update: ContentUpdate,
    ) -> Result<StateRecord, StorageError> {
        let guid = guid.to_string();
        self.run(move |conn| {
            let tx = immediate(conn)?;
            let current = load_state(&tx, &guid)?;
            if let Some(held) = &current.lock {
                if update.lock_id.as_deref() != Some(held.id.as_str()) {
                    return Err(StorageError::LockMismatch {
                        guid,
                        held: Some(held.clone()),
                    });
                }
            }
            if let Some(expected) = update.expected_serial {
                if expected != current.serial {
                    return Err(StorageError::SerialConflict {
                        expected,
                        actual: current.serial,
                    });
                }
            }
            if update.serial < current.serial {
                return Err(StorageError::SerialRegression {
                    current: current.serial,
                    attempted: update.serial,
                });
            }
            let size = i64::try_from(update.content.len())
                .map_err(|_| StorageError::Backend("content too large".to_string()))?;

            let existing: Vec<(String, Option<String>)> = {
                let mut stmt = tx
                    .prepare("SELECT key, schema_source FROM output_keys WHERE state_guid = ?1")
                    .map_err(db)?;
                let rows = stmt
                    .query_map(params![guid], |row| Ok((row.get(0)?, row.get(1)?)))
                    .map_err(db)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(db)?
            };
            for (key, source) in existing {
                if update.outputs.iter().any(|o| o.key == key) {
                    continue;
                }
                if source.as_deref() == Some(SchemaSource::Manual.as_str()) {
                    tx.execute(
                        "UPDATE output_keys SET digest = NULL, sensitive = 0, \
                         validation_status = 'not_validated', validation_error = NULL \
                         WHERE state_guid = ?1 AND key = ?2",
                        params![guid, key],
                    )
                    .map_err(db)?;
                } else {
                    tx.execute(
                        "DELETE FROM output_keys WHERE state_guid = ?1 AND key = ?2",
                        params![guid, key],
                    )
                    .map_err(db)?;
                }
            }
            for out in &update.outputs {
                tx.execute(
                    "INSERT INTO output_keys (state_guid, key, digest, sensitive) \
                     VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT (state_guid, key) DO UPDATE SET \
                       validation_status = CASE WHEN output_keys.digest IS excluded.digest \
                         THEN output_keys.validation_status ELSE 'not_validated' END, \
                       validation_error = CASE WHEN output_keys.digest IS excluded.digest \
                         THEN output_keys.validation_error ELSE NULL END, \
                       digest = excluded.digest, \
                       sensitive = excluded.sensitive",
                    params![guid, out.key, out.digest, out.sensitive],
                )
                .map_err(db)?;
            }

            tx.execute(
                "UPDATE states SET content = ?2, serial = ?3, lineage = ?4, \
                 terraform_version = ?5, size_bytes = ?6, updated_at = ?7 WHERE guid = ?1",
                params![
                    guid,
                    update.content,
                    update.serial,
                    update.lineage,
                    update.terraform_version,
                    size,
                    update.updated_at
                ],
            )
            .map_err(db)?;
            let record = load_state(&tx, &guid)?;
            tx.commit().map_err(db)?;
            Ok(record)
        })
        .await
    }

    async fn update_labels(
        &self,
        guid: &str,
        labels: Labels,
        updated_at: &str,
    ) -> Result<StateRecord, StorageError> {
        let guid = guid.to_string();
        let updated_at = updated_at.to_string();
        self.run(move |conn| {
            let tx = immediate(conn)?;
            ensure_state(&tx, &guid)?;
            write_labels(&tx, &guid, &labels)?;
            tx.execute(
                "UPDATE states SET updated_at = ?2 WHERE guid = ?1",
                params![guid, updated_at],
            )
            .map_err(db)?;
            let record = load_state(&tx, &guid)?;
            tx.commit().map_err(db)?;
            Ok(record)
        })
        .await
    }

    async fn lock_state(&self, guid: &str, lock: &LockInfo) -> Result<(), StorageError> {
        let guid = guid.to_string();
        let lock = lock.clone();
        self.run(move |conn| {
            let info = serde_json::to_string(&lock)
                .map_err(|e| StorageError::Backend(format!("encode lock info: {e}")))?;
            let tx = immediate(conn)?;
            let changed = tx
                .execute(
                    "UPDATE states SET lock_id = ?2, lock_info = ?3 \
                     WHERE guid = ?1 AND lock_id IS NULL",
                    params![guid, lock.id, info],
                )
                .map_err(db)?;
            if changed == 0 {
                let current = load_state(&tx, &guid)?;
                return match current.lock {
                    Some(existing) => Err(StorageError::LockConflict { existing }),
                    None => Err(StorageError::Backend(format!(
                        "lock on {guid} neither acquired nor held"
                    ))),
                };
            }
            tx.commit().map_err(db)?;
            Ok(())
        })
        .await
    }

    async fn unlock_state(&self, guid: &str, lock_id: &str) -> Result<(), StorageError> {
        let guid = guid.to_string();
        let lock_id = lock_id.to_string();
        self.run(move |conn| {
            let tx = immediate(conn)?;
            let changed = tx
                .execute(
                    "UPDATE states SET lock_id = NULL, lock_info = NULL \
                     WHERE guid = ?1 AND lock_id = ?2",
                    params![guid, lock_id],
                )
                .map_err(db)?;
            if changed == 0 {
                let current = load_state(&tx, &guid)?;
                return Err(StorageError::LockMismatch {
                    guid,
                    held: current.lock,
                });
            }
            tx.commit().map_err(db)?;
            Ok(())
        })
        .await
    }

    async fn list_outputs(&self, guid: &str) -> Result<Vec<OutputKeyRecord>, StorageError> {
        let guid = guid.to_string();
        self.run(move |conn| {
            ensure_state(conn, &guid)?;
            load_outputs(conn, &guid)
        })
        .await
    }

    async fn get_state_with_outputs(
        &self,
        guid: &str,
    ) -> Result<(StateRecord, Vec<OutputKeyRecord>), StorageError> {
        let guid = guid.to_string();
        self.run(move |conn| {
            let tx = conn.transaction().map_err(db)?;
            let state = load_state(&tx, &guid)?;
            let outputs = load_outputs(&tx, &guid)?;
            tx.commit().map_err(db)?;
            Ok((state, outputs))
        })
        .await
    }

    async fn set_output_schema(
        &self,
        guid: &str,
        key: &str,
        schema_json: &str,
        source: SchemaSource,
    ) -> Result<OutputKeyRecord, StorageError> {
        let guid = guid.to_string();
        let key = key.to_string();
        let schema_json = schema_json.to_string();
        self.run(move |conn| {
            let tx = immediate(conn)?;
            ensure_state(&tx, &guid)?;
            tx.execute(
                "INSERT INTO output_keys (state_guid, key, schema_json, schema_source) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT (state_guid, key) DO UPDATE SET \
                   schema_json = excluded.schema_json, \
                   schema_source = excluded.schema_source, \
                   validation_status = 'not_validated', \
                   validation_error = NULL",
                params![guid, key, schema_json, source.as_str()],
            )
            .map_err(db)?;
            let record = load_output(&tx, &guid, &key)?;
            tx.commit().map_err(db)?;
            Ok(record)
        })
        .await
    }

    async fn record_validation(
        &self,
        guid: &str,
        key: &str,
        status: ValidationStatus,
        error: Option<&str>,
        validated_at: &str,
    ) -> Result<(), StorageError> {
        let guid = guid.to_string();
        let key = key.to_string();
        let error = error.map(str::to_string);
        let validated_at = validated_at.to_string();
        self.run(move |conn| {
            conn.execute(
                "UPDATE output_keys SET validation_status = ?3, validation_error = ?4, \
                 validated_at = ?5 WHERE state_guid = ?1 AND key = ?2",
                params![guid, key, status.as_str(), error, validated_at],
            )
            .map_err(db)?;
            Ok(())
        })
        .await
    }
}

// ── EdgeStore ─────────────────────────────────────────────────────────────────

#[async_trait]
impl EdgeStore for SqliteStore {
    async fn insert_edge(&self, edge: NewEdge) -> Result<(EdgeRecord, bool), StorageError> {
        self.run(move |conn| {
            let tx = immediate(conn)?;
            let last_out_at = edge.out_digest.as_ref().map(|_| edge.created_at.clone());
            let inserted = tx
                .execute(
                    "INSERT INTO edges (from_guid, from_output, to_guid, to_input_name, status, \
                     out_digest, mock_value_json, last_out_at, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9) \
                     ON CONFLICT (from_guid, from_output, to_guid, to_input_name) DO NOTHING",
                    params![
                        edge.from_guid,
                        edge.from_output,
                        edge.to_guid,
                        edge.to_input_name,
                        edge.status.as_str(),
                        edge.out_digest,
                        edge.mock_value_json,
                        last_out_at,
                        edge.created_at
                    ],
                )
                .map_err(db)?;
            let record = tx
                .query_row(
                    &format!(
                        "SELECT {EDGE_COLUMNS} FROM edges WHERE from_guid = ?1 \
                         AND from_output = ?2 AND to_guid = ?3 AND to_input_name = ?4"
                    ),
                    params![
                        edge.from_guid,
                        edge.from_output,
                        edge.to_guid,
                        edge.to_input_name
                    ],
                    read_edge,
                )
                .map_err(db)?;
            tx.commit().map_err(db)?;
            Ok((record, inserted == 1))
        })
        .await
    }

    async fn get_edge(&self, id: i64) -> Result<EdgeRecord, StorageError> {
        self.run(move |conn| load_edge(conn, id)).await
    }

    async fn delete_edge(&self, id: i64) -> Result<(), StorageError> {
        self.run(move |conn| {
            let deleted = conn
                .execute("DELETE FROM edges WHERE id = ?1", params![id])
                .map_err(db)?;
            if deleted == 0 {
                return Err(StorageError::EdgeNotFound { id });
            }
            Ok(())
        })
        .await
    }

    async fn list_edges_from(&self, producer_guid: &str) -> Result<Vec<EdgeRecord>, StorageError> {
        let guid = producer_guid.to_string();
        self.run(move |conn| list_edges_where(conn, "from_guid", &guid))
            .await
    }

    async fn list_edges_to(&self, consumer_guid: &str) -> Result<Vec<EdgeRecord>, StorageError> {
        let guid = consumer_guid.to_string();
        self.run(move |conn| list_edges_where(conn, "to_guid", &guid))
            .await
    }

    async fn update_edge(&self, id: i64, update: EdgeUpdate) -> Result<EdgeRecord, StorageError> {
        self.run(move |conn| {
            let tx = immediate(conn)?;
            let changed = tx
                .execute(
                    "UPDATE edges SET status = ?2, in_digest = ?3, out_digest = ?4, \
                     last_in_at = ?5, last_out_at = ?6, updated_at = ?7 WHERE id = ?1",
                    params![
                        id,
                        update.status.as_str(),
                        update.in_digest,
                        update.out_digest,
                        update.last_in_at,
                        update.last_out_at,
                        update.updated_at
                    ],
                )
                .map_err(db)?;
            if changed == 0 {
                return Err(StorageError::EdgeNotFound { id });
            }
            let record = load_edge(&tx, id)?;
            tx.commit().map_err(db)?;
            Ok(record)
        })
        .await
    }
}
