use cellgrid_state::StateError;
use thiserror::Error;

pub type ConvergeResult<T> = Result<T, ConvergeError>;

#[derive(Debug, Error)]
pub enum ConvergeError {
    #[error("state error: {0}")]
    State(#[from] StateError),
}
