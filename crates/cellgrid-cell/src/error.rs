//! Error types for the cell agent.

use cellgrid_state::StateError;
use thiserror::Error;

pub type CellResult<T> = Result<T, CellError>;

#[derive(Debug, Error)]
pub enum CellError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("{0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer failed: {0}")]
    Transfer(String),

    /// A path in an action would leave the container sandbox.
    #[error("path escapes sandbox: {0}")]
    Sandbox(String),
}

impl From<reqwest::Error> for CellError {
    fn from(e: reqwest::Error) -> Self {
        CellError::Transfer(e.to_string())
    }
}
