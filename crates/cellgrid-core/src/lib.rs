//! cellgrid-core — configuration shared by the cellgrid daemons.

pub mod config;
pub mod duration;

pub use config::{CellgridConfig, Settings};
pub use duration::parse_duration;
