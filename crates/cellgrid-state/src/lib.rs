//! cellgrid-state — the desired/actual state store for cellgrid.
//!
//! Backed by [redb](https://docs.rs/redb), holds desired LRPs and tasks,
//! actual instances, cell presence, work orders, auction requests and
//! leases.
//!
//! # Consistency
//!
//! Every record is stored with a version stamp taken from a single
//! store-wide sequence, so a stamp is never reused even after a key is
//! deleted and recreated. Writers that race each other use the conditional
//! operations (`Expected::Absent` / `Expected::Version`); the loser gets
//! [`StateError::Conflict`] and is expected to re-read and retry or give up.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
