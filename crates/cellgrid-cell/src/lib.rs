//! cellgrid-cell — the per-cell agent.
//!
//! The agent advertises the cell's capacity, admits work orders against a
//! local [`CapacityLedger`], runs them through an [`Executor`] on a
//! [`ContainerRuntime`] and records outcomes in the state store.

pub mod agent;
pub mod capacity;
pub mod container;
pub mod env;
pub mod error;
pub mod executor;
pub mod logs;
pub mod transfer;

pub use agent::{CellAgent, CellConfig};
pub use capacity::{CapacityLedger, Reservation};
pub use container::{Container, ContainerRuntime, ContainerSpec, ProcessRuntime, RunOutcome};
pub use error::{CellError, CellResult};
pub use executor::{Completion, Executor, OUT_OF_MEMORY_REASON};
pub use logs::{ChannelLogSink, LogMessage, LogSink, LogStream, TracingLogSink};
pub use transfer::{MAX_RESULT_BYTES, Transfer};
