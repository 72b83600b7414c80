use crate::record::LockInfo;

/// All errors that can be returned by a `StateStore` or `EdgeStore` implementation.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No state with the given GUID.
    #[error("state not found: {guid}")]
    StateNotFound { guid: String },

    /// No state carries the given logic id.
    #[error("state not found for logic id: {logic_id}")]
    LogicIdNotFound { logic_id: String },

    /// No dependency edge with the given id.
    #[error("dependency edge not found: {id}")]
    EdgeNotFound { id: i64 },

    /// A unique column (`guid` or `logic_id`) already holds this value.
    #[error("{field} already exists: {value}")]
    AlreadyExists { field: String, value: String },

    /// The state is locked by someone else. Carries the holder's lock info so
    /// callers can report who holds it.
    #[error("state is locked by {} (lock id {})", existing.who, existing.id)]
    LockConflict { existing: LockInfo },

    /// The supplied lock id does not match the held lock (or nothing is held).
    #[error("lock id mismatch on state {guid}")]
    LockMismatch {
        guid: String,
        held: Option<LockInfo>,
    },

    /// `expected_serial` was supplied and the stored serial differs.
    #[error("serial conflict: expected {expected}, stored {actual}")]
    SerialConflict { expected: i64, actual: i64 },

    /// The uploaded serial is lower than the stored one.
    #[error("serial regression: stored {current}, attempted {attempted}")]
    SerialRegression { current: i64, attempted: i64 },

    /// A backend-specific storage error (DB connection, serialization, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}
