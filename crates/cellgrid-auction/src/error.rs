use cellgrid_state::StateError;
use thiserror::Error;

pub type AuctionResult<T> = Result<T, AuctionError>;

#[derive(Debug, Error)]
pub enum AuctionError {
    #[error("state error: {0}")]
    State(#[from] StateError),
}
