//! cellgrid converger — desired/actual diff and repair.
//!
//! A lease-guarded loop that compares one store snapshot against the
//! desired state and repairs what drifted: missing instances are put up
//! for auction, extra instances are stopped, and records left behind by
//! dead cells are cleared.
//!
//! # Components
//!
//! - **`plan`** — Pure diff from a snapshot to a list of [`Intent`]s
//! - **`apply`** — Conditional writes that carry out intents
//! - **`converger`** — The loop

pub mod apply;
pub mod converger;
pub mod error;
pub mod plan;

pub use apply::{ApplyReport, apply, apply_while};
pub use converger::{Converger, ConvergerConfig};
pub use error::{ConvergeError, ConvergeResult};
pub use plan::{Intent, Policy, plan};
