use crate::types::QualifiedKey;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum VersoError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("branch not found: {0}")]
    BranchNotFound(String),
    #[error("branch already exists: {0}")]
    BranchAlreadyExists(String),
    #[error("branch '{0}' has been deleted")]
    BranchDeleted(String),
    #[error(
        "invalid transaction timestamp {requested} on branch '{branch}': branch is at {now}"
    )]
    InvalidTransactionTimestamp {
        branch: String,
        requested: u64,
        now: u64,
    },
    #[error("invalid transaction state: {0}")]
    TransactionState(String),
    #[error("commit rejected: {0}")]
    CommitRejected(String),
    #[error("commit conflict on {key}: {message}")]
    CommitConflict { key: QualifiedKey, message: String },
    #[error("commit failed on branch '{branch}': {source}")]
    CommitFailed {
        branch: String,
        #[source]
        source: Box<VersoError>,
    },
    #[error("dateback error: {0}")]
    Dateback(String),
    #[error("index error: {0}")]
    Index(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<redb::DatabaseError> for VersoError {
    fn from(e: redb::DatabaseError) -> Self {
        VersoError::Storage(e.to_string())
    }
}
impl From<redb::TransactionError> for VersoError {
    fn from(e: redb::TransactionError) -> Self {
        VersoError::Storage(e.to_string())
    }
}
impl From<redb::TableError> for VersoError {
    fn from(e: redb::TableError) -> Self {
        VersoError::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for VersoError {
    fn from(e: redb::StorageError) -> Self {
        VersoError::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for VersoError {
    fn from(e: redb::CommitError) -> Self {
        VersoError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VersoError>;
