//! redb table definitions for the cellgrid state store.
//!
//! Every table uses `&str` keys and `&[u8]` values holding a JSON
//! [`Versioned`](crate::types::Versioned) envelope. Instance indices inside
//! keys are zero-padded so that lexical order matches numeric order.

use redb::TableDefinition;

/// Desired LRPs keyed by `{process_guid}`.
pub const DESIRED_LRPS: TableDefinition<&str, &[u8]> = TableDefinition::new("desired_lrps");

/// Tasks keyed by `{task_guid}`.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Actual instances keyed by `{process_guid}/{index:010}`.
pub const ACTUAL: TableDefinition<&str, &[u8]> = TableDefinition::new("actual");

/// Cell presence keyed by `{cell_id}`.
pub const CELLS: TableDefinition<&str, &[u8]> = TableDefinition::new("cells");

/// Work orders keyed by `{cell_id}/{work_key}`.
pub const ORDERS: TableDefinition<&str, &[u8]> = TableDefinition::new("orders");

/// Pending auction requests keyed by `{work_key}`.
pub const AUCTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("auctions");

/// Leases keyed by lock name.
pub const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");

/// Store bookkeeping; holds the version sequence.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key in [`META`] holding the last issued version.
pub const VERSION_SEQ: &str = "version_seq";
