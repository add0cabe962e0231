use cellgrid_state::StateError;
use thiserror::Error;

pub type LockResult<T> = Result<T, LockError>;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("invalid lease configuration: {0}")]
    Config(String),
}
