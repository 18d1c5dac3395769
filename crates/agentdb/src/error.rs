//! Error types for the agent state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("commit error: {0}")]
    Commit(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("duplicate record: {0}")]
    Duplicate(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown storage backend: {0}")]
    Backend(String),

    #[error("configuration error: {0}")]
    Config(#[from] agentdb_core::ConfigError),
}

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvariantViolation,
    SerializationFailure,
    StorageFailure,
    InvalidArgument,
}

impl StateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StateError::NotFound(_) => ErrorKind::NotFound,
            StateError::InvariantViolation(_) | StateError::Duplicate(_) => {
                ErrorKind::InvariantViolation
            }
            StateError::Serialize(_) | StateError::Deserialize(_) => {
                ErrorKind::SerializationFailure
            }
            StateError::InvalidArgument(_) | StateError::Backend(_) | StateError::Config(_) => {
                ErrorKind::InvalidArgument
            }
            StateError::Open(_)
            | StateError::Transaction(_)
            | StateError::Table(_)
            | StateError::Read(_)
            | StateError::Write(_)
            | StateError::Commit(_) => ErrorKind::StorageFailure,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub(crate) use map_err;
