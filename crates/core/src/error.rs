use stategraph_storage::{LockInfo, StorageError};

/// Errors returned by engine operations.
///
/// Each variant corresponds to one error kind surfaced to clients; the
/// HTTP layer maps them onto status codes via [`Error::kind`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed GUID, logic id, edge request, or a serial rule violation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Another operation holds the lock. Carries the holder's metadata.
    #[error("state is locked by {} (lock id {})", .0.who, .0.id)]
    LockConflict(LockInfo),

    /// The presented lock id does not match the held lock.
    #[error("{message}")]
    LockMismatch {
        message: String,
        held: Option<LockInfo>,
    },

    /// Label policy or structural rule rejected the request.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// Uploaded state content could not be parsed.
    #[error("invalid state content: {0}")]
    InvalidContent(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid_argument",
            Error::NotFound(_) => "not_found",
            Error::AlreadyExists(_) => "already_exists",
            Error::LockConflict(_) => "lock_conflict",
            Error::LockMismatch { .. } => "lock_mismatch",
            Error::ValidationFailed(_) => "validation_failed",
            Error::InvalidContent(_) => "invalid_content",
            Error::Storage(_) => "storage",
        }
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::StateNotFound { guid } => Error::NotFound(format!("state {guid}")),
            StorageError::LogicIdNotFound { logic_id } => {
                Error::NotFound(format!("state with logic id '{logic_id}'"))
            }
            StorageError::EdgeNotFound { id } => Error::NotFound(format!("dependency edge {id}")),
            StorageError::AlreadyExists { field, value } => {
                Error::AlreadyExists(format!("{field} '{value}'"))
            }
            StorageError::LockConflict { existing } => Error::LockConflict(existing),
            StorageError::LockMismatch { guid, held } => {
                let message = match &held {
                    Some(h) => format!("state {guid} is locked with a different lock id ({})", h.id),
                    None => format!("state {guid} is not locked"),
                };
                Error::LockMismatch { message, held }
            }
            StorageError::SerialConflict { expected, actual } => Error::InvalidArgument(format!(
                "serial conflict: expected {expected}, stored {actual}"
            )),
            StorageError::SerialRegression { current, attempted } => {
                Error::InvalidArgument(format!(
                    "serial regression: stored serial is {current}, upload has {attempted}"
                ))
            }
            StorageError::Backend(msg) => Error::Storage(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
