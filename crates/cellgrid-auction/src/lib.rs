//! cellgrid auctioneer — bids, placement rounds, work orders.
//!
//! Each round reads one snapshot of the state store, asks every eligible
//! cell for a bid on each queued auction request, and turns the winning
//! bids into start orders. The auctioneer keeps no state between rounds;
//! a replacement picks up exactly where a crashed one stopped.
//!
//! # Components
//!
//! - **`scorer`** — Cell eligibility and the pluggable [`BidStrategy`]
//! - **`placer`** — Pure round planning over a snapshot
//! - **`convert`** — Type conversions from state store types
//! - **`auctioneer`** — Lease-guarded loop that applies round plans

pub mod auctioneer;
pub mod convert;
pub mod error;
pub mod placer;
pub mod scorer;

pub use auctioneer::{Auctioneer, AuctioneerConfig, RoundReport};
pub use error::{AuctionError, AuctionResult};
pub use placer::{Award, RoundPlan, plan_round};
pub use scorer::{Bid, BidStrategy, CellResources, LeastLoaded, PlacementRequest, ScoringWeights, rank_cells};
