//! cellgrid-lock — leases and leader election.
//!
//! A lease is a record in the state store's lease table naming an owner, a
//! term and an expiry. [`LockService`] performs the conditional writes that
//! acquire, renew and release it; [`LeaderElector`] keeps one lease alive in
//! the background and publishes the current grant to [`LeaderHandle`]s.
//!
//! The term goes up every time ownership changes hands. Leaders stamp
//! their writes with it so the store can refuse work from a deposed leader.

pub mod elector;
pub mod error;
pub mod service;

pub use elector::{ElectorConfig, LeaderElector, LeaderHandle, LeaseGrant};
pub use error::{LockError, LockResult};
pub use service::LockService;

/// Lock held by the active auctioneer.
pub const AUCTIONEER_LOCK: &str = "auctioneer";

/// Lock held by the active converger.
pub const CONVERGER_LOCK: &str = "converger";
