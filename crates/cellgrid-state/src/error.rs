//! Error types for the cellgrid state store.

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

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A conditional write lost against a concurrent writer.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Rejected at admission.
    #[error("invalid: {0}")]
    Invalid(String),

    /// The writer no longer holds the lease it claims to act under.
    #[error("fenced: {0}")]
    Fenced(String),
}

impl StateError {
    /// True for errors that mean "someone else got there first".
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StateError::Conflict(_) | StateError::AlreadyExists(_) | StateError::NotFound(_)
        )
    }
}
