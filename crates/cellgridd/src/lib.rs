//! cellgridd — assembly of cellgrid components into running tasks.
//!
//! The binary uses this to run a standalone node; the integration tests
//! use it to build fleets in a single process and to kill individual
//! components.

pub mod components;
pub mod seed;

pub use components::{Component, spawn_auctioneer, spawn_cell, spawn_converger};
pub use seed::{DesiredFile, seed_desired};
