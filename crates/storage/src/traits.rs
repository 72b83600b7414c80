use async_trait::async_trait;

use crate::error::StorageError;
use crate::record::{
    ContentUpdate, EdgeRecord, EdgeUpdate, Labels, LockInfo, NewEdge, NewState, OutputKeyRecord,
    SchemaSource, StateQuery, StateRecord, ValidationStatus,
};

/// Persistence for `State` and `OutputKey` rows.
///
/// ## Atomicity
///
/// `update_content` MUST write the content bytes, serial, lineage and the
/// full output-key set in one transaction. A concurrent reader observes
/// either the previous `(content, serial, outputs)` triple or the new one,
/// never a mix.
///
/// ## Locking
///
/// `lock_state` / `unlock_state` are a compare-and-swap on the stored lock
/// id, never an in-process mutex, so they stay correct when several server
/// processes share one database. Reads never block on a held lock.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync + 'static` to be used in axum
/// application state and across async task boundaries.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    // ── States ────────────────────────────────────────────────────────────────

    /// Insert a new state with no content (serial 0).
    ///
    /// Returns `Err(StorageError::AlreadyExists)` if the GUID or logic id is taken.
    async fn create_state(&self, state: NewState) -> Result<StateRecord, StorageError>;

    /// Returns `Err(StorageError::StateNotFound)` if the state does not exist.
    async fn get_state(&self, guid: &str) -> Result<StateRecord, StorageError>;

    /// Returns `Err(StorageError::LogicIdNotFound)` if no state carries this logic id.
    async fn get_state_by_logic_id(&self, logic_id: &str) -> Result<StateRecord, StorageError>;

    /// List states matching `query`, ordered by GUID ascending.
    async fn list_states(&self, query: &StateQuery) -> Result<Vec<StateRecord>, StorageError>;

    /// Raw content bytes, `None` if nothing has been uploaded yet.
    async fn get_content(&self, guid: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace content, serial and outputs atomically.
    ///
    /// Checks, in order, inside the same transaction:
    /// 1. the state exists (`StateNotFound`)
    /// 2. if locked, `update.lock_id` equals the held id (`LockMismatch`)
    /// 3. `expected_serial`, if set, equals the stored serial (`SerialConflict`)
    /// 4. `update.serial` is not lower than the stored serial (`SerialRegression`)
    ///
    /// Output rows absent from `update.outputs` are deleted unless they carry
    /// a manual schema, in which case their digest is cleared. Rows whose
    /// digest changes are reset to `ValidationStatus::NotValidated`.
    async fn update_content(
        &self,
        guid: &str,
        update: ContentUpdate,
    ) -> Result<StateRecord, StorageError>;

    /// Replace the full label map.
    async fn update_labels(
        &self,
        guid: &str,
        labels: Labels,
        updated_at: &str,
    ) -> Result<StateRecord, StorageError>;

    // ── Locks ─────────────────────────────────────────────────────────────────

    /// Acquire the exclusive lock. Fails fast with
    /// `Err(StorageError::LockConflict { existing })` if any lock is held.
    async fn lock_state(&self, guid: &str, lock: &LockInfo) -> Result<(), StorageError>;

    /// Release the lock if `lock_id` matches the held lock; otherwise
    /// `Err(StorageError::LockMismatch)` and nothing changes.
    async fn unlock_state(&self, guid: &str, lock_id: &str) -> Result<(), StorageError>;

    // ── Outputs ───────────────────────────────────────────────────────────────

    /// All output rows for a state, ordered by key.
    async fn list_outputs(&self, guid: &str) -> Result<Vec<OutputKeyRecord>, StorageError>;

    /// The state row and its output rows read from one snapshot.
    ///
    /// A concurrent `update_content` is observed either entirely or not at
    /// all: the returned serial always matches the returned digests.
    async fn get_state_with_outputs(
        &self,
        guid: &str,
    ) -> Result<(StateRecord, Vec<OutputKeyRecord>), StorageError>;

    /// Attach a schema to an output, creating a placeholder row if needed.
    async fn set_output_schema(
        &self,
        guid: &str,
        key: &str,
        schema_json: &str,
        source: SchemaSource,
    ) -> Result<OutputKeyRecord, StorageError>;

    /// Persist the outcome of validating an output value against its schema.
    /// A missing output row is ignored (the output vanished in a later upload).
    async fn record_validation(
        &self,
        guid: &str,
        key: &str,
        status: ValidationStatus,
        error: Option<&str>,
        validated_at: &str,
    ) -> Result<(), StorageError>;
}

/// Persistence for `DependencyEdge` rows.
///
/// Edges reference states by GUID only; either endpoint may be missing
/// without the edge store noticing.
#[async_trait]
pub trait EdgeStore: Send + Sync + 'static {
    /// Insert an edge, or return the existing one with the same
    /// `(from_guid, from_output, to_guid, to_input_name)`.
    ///
    /// The boolean is `true` when a new row was created. Must be safe under
    /// concurrent calls: exactly one caller creates the row.
    async fn insert_edge(&self, edge: NewEdge) -> Result<(EdgeRecord, bool), StorageError>;

    /// Returns `Err(StorageError::EdgeNotFound)` if the edge does not exist.
    async fn get_edge(&self, id: i64) -> Result<EdgeRecord, StorageError>;

    /// Returns `Err(StorageError::EdgeNotFound)` if the edge does not exist.
    async fn delete_edge(&self, id: i64) -> Result<(), StorageError>;

    /// Outgoing edges of a producer, ordered by id.
    async fn list_edges_from(&self, producer_guid: &str) -> Result<Vec<EdgeRecord>, StorageError>;

    /// Incoming edges of a consumer, ordered by id.
    async fn list_edges_to(&self, consumer_guid: &str) -> Result<Vec<EdgeRecord>, StorageError>;

    /// Overwrite the derived fields of an edge.
    async fn update_edge(&self, id: i64, update: EdgeUpdate) -> Result<EdgeRecord, StorageError>;
}

/// A backend providing both halves of persistence.
pub trait Storage: StateStore + EdgeStore {}

impl<T: StateStore + EdgeStore> Storage for T {}
