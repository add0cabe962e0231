//! StateStore — redb-backed state persistence for cellgrid.
//!
//! Typed operations over desired workloads, actual instances, cells, work
//! orders, auction requests and leases. Writes that can race another actor
//! are conditional on the version the caller last read. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{
    Database, ReadTransaction, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        self.write(|txn| {
            for def in [DESIRED_LRPS, TASKS, ACTUAL, CELLS, ORDERS, AUCTIONS, LEASES] {
                txn.open_table(def).map_err(map_err!(Table))?;
            }
            txn.open_table(META).map_err(map_err!(Table))?;
            Ok(())
        })
    }

    /// Run `f` in a write transaction, committing only if it succeeds.
    fn write<R>(&self, f: impl FnOnce(&WriteTransaction) -> StateResult<R>) -> StateResult<R> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        match f(&txn) {
            Ok(out) => {
                txn.commit().map_err(map_err!(Transaction))?;
                Ok(out)
            }
            Err(e) => {
                txn.abort().map_err(map_err!(Transaction))?;
                Err(e)
            }
        }
    }

    fn read(&self) -> StateResult<ReadTransaction> {
        self.db.begin_read().map_err(map_err!(Transaction))
    }

    // ── Desired state ──────────────────────────────────────────────

    /// Admit a new desired workload and queue its placements.
    ///
    /// An LRP gets one auction request per instance index; a task gets one
    /// for itself. Both happen in the same transaction as the insert.
    /// Creation timestamps are set here; whatever the caller sent is
    /// replaced.
    pub fn create_desired(&self, workload: &DesiredWorkload) -> StateResult<Version> {
        validate_workload(workload)?;
        let now = epoch_millis();
        let version = self.write(|txn| match workload {
            DesiredWorkload::Lrp(lrp) => {
                let lrp = DesiredLrp {
                    created_at: now,
                    ..lrp.clone()
                };
                let version = put_if(txn, DESIRED_LRPS, &lrp.process_guid, Expected::Absent, &lrp)?;
                for index in 0..lrp.instances {
                    enqueue(txn, &Placement::lrp(&lrp.process_guid, index), now)?;
                }
                Ok(version)
            }
            DesiredWorkload::Task(task) => {
                let task = Task {
                    created_at: now,
                    updated_at: now,
                    ..task.clone()
                };
                let version = put_if(txn, TASKS, &task.task_guid, Expected::Absent, &task)?;
                enqueue(txn, &Placement::task(&task.task_guid), now)?;
                Ok(version)
            }
        })?;
        debug!(guid = workload.guid(), version, "desired workload created");
        Ok(version)
    }

    /// Get a desired LRP by process GUID.
    pub fn get_desired_lrp(&self, process_guid: &str) -> StateResult<Option<Versioned<DesiredLrp>>> {
        get_from(&self.read()?, DESIRED_LRPS, process_guid)
    }

    /// List all desired LRPs.
    pub fn list_desired_lrps(&self) -> StateResult<Vec<Versioned<DesiredLrp>>> {
        scan(&self.read()?, DESIRED_LRPS, "")
    }

    /// List every desired workload, LRPs first.
    pub fn list_desired(&self) -> StateResult<Vec<DesiredWorkload>> {
        let txn = self.read()?;
        let lrps = scan::<DesiredLrp>(&txn, DESIRED_LRPS, "")?;
        let tasks = scan::<Task>(&txn, TASKS, "")?;
        Ok(lrps
            .into_iter()
            .map(|v| DesiredWorkload::Lrp(v.value))
            .chain(tasks.into_iter().map(|v| DesiredWorkload::Task(v.value)))
            .collect())
    }

    /// Change the desired instance count of an LRP.
    ///
    /// Newly desired indices are queued for auction. Indices above the new
    /// count are left for the converger to stop.
    pub fn update_desired_instance_count(
        &self,
        process_guid: &str,
        instances: u32,
    ) -> StateResult<Version> {
        let now = epoch_millis();
        let version = self.write(|txn| {
            let current: Versioned<DesiredLrp> = get_in(txn, DESIRED_LRPS, process_guid)?
                .ok_or_else(|| StateError::NotFound(format!("desired lrp {process_guid}")))?;
            let previous = current.value.instances;
            let mut lrp = current.value;
            lrp.instances = instances;
            let version = put_in(txn, DESIRED_LRPS, process_guid, &lrp)?;
            for index in previous..instances {
                enqueue(txn, &Placement::lrp(process_guid, index), now)?;
            }
            Ok(version)
        })?;
        debug!(%process_guid, instances, version, "desired instance count updated");
        Ok(version)
    }

    /// Delete a desired LRP and any of its queued auction requests.
    /// Returns true if it existed.
    pub fn remove_desired(&self, process_guid: &str) -> StateResult<bool> {
        let existed = self.write(|txn| {
            let existed = {
                let mut table = txn.open_table(DESIRED_LRPS).map_err(map_err!(Table))?;
                table.remove(process_guid).map_err(map_err!(Write))?.is_some()
            };
            let prefix = format!("lrp/{process_guid}/");
            let keys = keys_with_prefix(txn, AUCTIONS, &prefix)?;
            let mut table = txn.open_table(AUCTIONS).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            Ok(existed)
        })?;
        debug!(%process_guid, existed, "desired lrp removed");
        Ok(existed)
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Get a task by GUID.
    pub fn get_task(&self, task_guid: &str) -> StateResult<Option<Versioned<Task>>> {
        get_from(&self.read()?, TASKS, task_guid)
    }

    /// List all tasks regardless of state.
    pub fn list_tasks(&self) -> StateResult<Vec<Versioned<Task>>> {
        scan(&self.read()?, TASKS, "")
    }

    /// List tasks that reached `Completed`, successfully or not.
    pub fn list_completed_tasks(&self) -> StateResult<Vec<Task>> {
        Ok(self
            .list_tasks()?
            .into_iter()
            .map(|v| v.value)
            .filter(|t| t.state == TaskState::Completed)
            .collect())
    }

    /// Replace a task if it is still at `expected`.
    pub fn compare_and_swap_task(
        &self,
        task_guid: &str,
        expected: Version,
        task: &Task,
    ) -> StateResult<Version> {
        let version = self.write(|txn| {
            put_if(txn, TASKS, task_guid, Expected::Version(expected), task)
        })?;
        debug!(%task_guid, state = ?task.state, version, "task updated");
        Ok(version)
    }

    /// Delete a task if it is still at `expected`.
    pub fn remove_task(&self, task_guid: &str, expected: Version) -> StateResult<()> {
        self.write(|txn| remove_if(txn, TASKS, task_guid, expected))?;
        debug!(%task_guid, "task removed");
        Ok(())
    }

    // ── Actual instances ───────────────────────────────────────────

    /// Insert or replace an actual instance under a precondition.
    ///
    /// `Expected::Absent` claims an empty slot; a second claimant for the
    /// same (process, index) gets [`StateError::AlreadyExists`].
    pub fn upsert_actual(
        &self,
        instance: &ActualInstance,
        expected: Expected,
    ) -> StateResult<Version> {
        let key = instance.table_key();
        let version = self.write(|txn| put_if(txn, ACTUAL, &key, expected, instance))?;
        debug!(
            process_guid = %instance.process_guid,
            index = instance.index,
            cell_id = %instance.cell_id,
            state = ?instance.state,
            version,
            "actual instance written"
        );
        Ok(version)
    }

    /// Get the actual instance occupying a slot.
    pub fn get_actual(
        &self,
        process_guid: &str,
        index: u32,
    ) -> StateResult<Option<Versioned<ActualInstance>>> {
        get_from(&self.read()?, ACTUAL, &actual_key(process_guid, index))
    }

    /// List all actual instances.
    pub fn list_actual(&self) -> StateResult<Vec<Versioned<ActualInstance>>> {
        scan(&self.read()?, ACTUAL, "")
    }

    /// List actual instances of one process, ordered by index.
    pub fn list_actual_for_process(
        &self,
        process_guid: &str,
    ) -> StateResult<Vec<Versioned<ActualInstance>>> {
        scan(&self.read()?, ACTUAL, &format!("{process_guid}/"))
    }

    /// Delete an actual instance if it is still at `expected`.
    pub fn remove_actual(&self, process_guid: &str, index: u32, expected: Version) -> StateResult<()> {
        let key = actual_key(process_guid, index);
        self.write(|txn| remove_if(txn, ACTUAL, &key, expected))?;
        debug!(%process_guid, index, "actual instance removed");
        Ok(())
    }

    // ── Cells ──────────────────────────────────────────────────────

    /// Publish a cell's presence record. Only the owning agent calls this.
    pub fn put_cell(&self, cell: &CellRecord) -> StateResult<Version> {
        self.write(|txn| put_in(txn, CELLS, &cell.cell_id, cell))
    }

    /// Get a cell by ID.
    pub fn get_cell(&self, cell_id: &str) -> StateResult<Option<Versioned<CellRecord>>> {
        get_from(&self.read()?, CELLS, cell_id)
    }

    /// List all cells, fresh or not.
    pub fn list_cells(&self) -> StateResult<Vec<Versioned<CellRecord>>> {
        scan(&self.read()?, CELLS, "")
    }

    /// Delete a cell record unless it was refreshed since `expected`.
    pub fn remove_cell(&self, cell_id: &str, expected: Version) -> StateResult<()> {
        self.write(|txn| remove_if(txn, CELLS, cell_id, expected))?;
        debug!(%cell_id, "cell removed");
        Ok(())
    }

    // ── Work orders ────────────────────────────────────────────────

    /// Create an order on behalf of the holder of `lock`.
    ///
    /// Fails with [`StateError::Fenced`] unless the lease named `lock` is
    /// live at `order.term`, and with [`StateError::AlreadyExists`] if the
    /// cell already has an order for the same work.
    pub fn create_order(&self, lock: &str, order: &WorkOrder) -> StateResult<Version> {
        let key = order.table_key();
        let version = self.write(|txn| {
            check_fence(txn, lock, order.term)?;
            put_if(txn, ORDERS, &key, Expected::Absent, order)
        })?;
        debug!(%key, term = order.term, "work order created");
        Ok(version)
    }

    /// Turn a queued auction request into a start order in one step.
    ///
    /// The order is created only if the request is still at
    /// `request_version` and `lock` is held at `order.term`.
    pub fn award_auction(
        &self,
        lock: &str,
        order: &WorkOrder,
        request_version: Version,
    ) -> StateResult<Version> {
        let Work::Start(placement) = &order.work else {
            return Err(StateError::Invalid("only start orders settle auctions".into()));
        };
        let request_key = placement.work_key();
        let order_key = order.table_key();
        let version = self.write(|txn| {
            check_fence(txn, lock, order.term)?;
            remove_if(txn, AUCTIONS, &request_key, request_version)?;
            put_if(txn, ORDERS, &order_key, Expected::Absent, order)
        })?;
        debug!(key = %order_key, term = order.term, "auction awarded");
        Ok(version)
    }

    /// List all outstanding orders.
    pub fn list_orders(&self) -> StateResult<Vec<Versioned<WorkOrder>>> {
        scan(&self.read()?, ORDERS, "")
    }

    /// List outstanding orders addressed to one cell.
    pub fn list_orders_for_cell(&self, cell_id: &str) -> StateResult<Vec<Versioned<WorkOrder>>> {
        scan(&self.read()?, ORDERS, &format!("{cell_id}/"))
    }

    /// Delete an order if it is still at `expected`.
    pub fn remove_order(&self, cell_id: &str, work_key: &str, expected: Version) -> StateResult<()> {
        let key = order_key(cell_id, work_key);
        self.write(|txn| remove_if(txn, ORDERS, &key, expected))?;
        debug!(%key, "work order removed");
        Ok(())
    }

    // ── Auction requests ───────────────────────────────────────────

    /// Queue a placement. Returns false if an identical request is
    /// already waiting.
    pub fn request_auction(&self, target: &Placement) -> StateResult<bool> {
        let now = epoch_millis();
        let created = self.write(|txn| enqueue(txn, target, now))?;
        if created {
            debug!(key = %target.work_key(), "auction requested");
        }
        Ok(created)
    }

    /// Get a queued request by work key.
    pub fn get_auction_request(&self, work_key: &str) -> StateResult<Option<Versioned<AuctionRequest>>> {
        get_from(&self.read()?, AUCTIONS, work_key)
    }

    /// List queued requests in work-key order.
    pub fn list_auction_requests(&self) -> StateResult<Vec<Versioned<AuctionRequest>>> {
        scan(&self.read()?, AUCTIONS, "")
    }

    /// Delete a queued request if it is still at `expected`.
    pub fn remove_auction_request(&self, work_key: &str, expected: Version) -> StateResult<()> {
        self.write(|txn| remove_if(txn, AUCTIONS, work_key, expected))?;
        debug!(%work_key, "auction request removed");
        Ok(())
    }

    // ── Leases ─────────────────────────────────────────────────────

    /// Get the stored lease for a lock name, live or expired.
    pub fn get_lease(&self, name: &str) -> StateResult<Option<Versioned<LeaseRecord>>> {
        get_from(&self.read()?, LEASES, name)
    }

    /// Write a lease record under a precondition.
    pub fn write_lease(&self, lease: &LeaseRecord, expected: Expected) -> StateResult<Version> {
        self.write(|txn| put_if(txn, LEASES, &lease.name, expected, lease))
    }

    // ── Snapshot ───────────────────────────────────────────────────

    /// Read every table in one transaction.
    pub fn snapshot(&self) -> StateResult<Snapshot> {
        let txn = self.read()?;
        Ok(Snapshot {
            taken_at: epoch_millis(),
            desired_lrps: scan(&txn, DESIRED_LRPS, "")?,
            tasks: scan(&txn, TASKS, "")?,
            actual: scan(&txn, ACTUAL, "")?,
            cells: scan(&txn, CELLS, "")?,
            orders: scan(&txn, ORDERS, "")?,
            auctions: scan(&txn, AUCTIONS, "")?,
        })
    }
}

// ── Admission ──────────────────────────────────────────────────────

fn validate_workload(workload: &DesiredWorkload) -> StateResult<()> {
    let guid = workload.guid();
    if guid.is_empty() || guid.contains('/') {
        return Err(StateError::Invalid(format!(
            "guid must be non-empty and must not contain '/': {guid:?}"
        )));
    }
    if workload.stack().is_empty() {
        return Err(StateError::Invalid(format!("{guid}: stack is required")));
    }
    let resources = workload.resources();
    if resources.memory_mb == 0 || resources.disk_mb == 0 {
        return Err(StateError::Invalid(format!(
            "{guid}: memory_mb and disk_mb must be positive"
        )));
    }
    if workload.actions().is_empty() {
        return Err(StateError::Invalid(format!("{guid}: at least one action is required")));
    }
    for step in workload.actions() {
        if step.timeout_ms == Some(0) {
            return Err(StateError::Invalid(format!("{guid}: timeout must be positive")));
        }
        let empty = match &step.action {
            Action::Run { script, .. } => script.is_empty(),
            Action::Download { from, to, .. } | Action::Upload { from, to } => {
                from.is_empty() || to.is_empty()
            }
            Action::FetchResult { file } => file.is_empty(),
        };
        if empty {
            return Err(StateError::Invalid(format!(
                "{guid}: {} action has empty fields",
                step.action.kind()
            )));
        }
    }
    if let DesiredWorkload::Task(task) = workload
        && (task.state != TaskState::Pending || task.cell_id.is_some())
    {
        return Err(StateError::Invalid(format!("{guid}: new tasks must be pending")));
    }
    Ok(())
}

// ── Transaction helpers ────────────────────────────────────────────

/// Just the version field of a stored envelope.
#[derive(Deserialize)]
struct Stamp {
    version: Version,
}

fn encode<T: Serialize>(version: Version, value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(&Versioned { version, value }).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<Versioned<T>> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn next_version(txn: &WriteTransaction) -> StateResult<Version> {
    let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
    let current = meta
        .get(VERSION_SEQ)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    meta.insert(VERSION_SEQ, next).map_err(map_err!(Write))?;
    Ok(next)
}

fn current_version(txn: &WriteTransaction, def: JsonTable, key: &str) -> StateResult<Option<Version>> {
    let table = txn.open_table(def).map_err(map_err!(Table))?;
    let found = match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let stamp: Stamp =
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Some(stamp.version)
        }
        None => None,
    };
    Ok(found)
}

fn check_expected(key: &str, expected: Expected, found: Option<Version>) -> StateResult<()> {
    match (expected, found) {
        (Expected::Absent, None) => Ok(()),
        (Expected::Absent, Some(_)) => Err(StateError::AlreadyExists(key.to_string())),
        (Expected::Version(_), None) => Err(StateError::NotFound(key.to_string())),
        (Expected::Version(want), Some(have)) if want == have => Ok(()),
        (Expected::Version(want), Some(have)) => Err(StateError::Conflict(format!(
            "{key}: expected version {want}, found {have}"
        ))),
    }
}

fn get_in<T: DeserializeOwned>(
    txn: &WriteTransaction,
    def: JsonTable,
    key: &str,
) -> StateResult<Option<Versioned<T>>> {
    let table = txn.open_table(def).map_err(map_err!(Table))?;
    let found = match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Some(decode(guard.value())?),
        None => None,
    };
    Ok(found)
}

fn put_in<T: Serialize>(txn: &WriteTransaction, def: JsonTable, key: &str, value: &T) -> StateResult<Version> {
    let version = next_version(txn)?;
    let bytes = encode(version, value)?;
    let mut table = txn.open_table(def).map_err(map_err!(Table))?;
    table.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
    Ok(version)
}

fn put_if<T: Serialize>(
    txn: &WriteTransaction,
    def: JsonTable,
    key: &str,
    expected: Expected,
    value: &T,
) -> StateResult<Version> {
    check_expected(key, expected, current_version(txn, def, key)?)?;
    put_in(txn, def, key, value)
}

fn remove_if(txn: &WriteTransaction, def: JsonTable, key: &str, expected: Version) -> StateResult<()> {
    check_expected(key, Expected::Version(expected), current_version(txn, def, key)?)?;
    let mut table = txn.open_table(def).map_err(map_err!(Table))?;
    table.remove(key).map_err(map_err!(Write))?;
    Ok(())
}

fn enqueue(txn: &WriteTransaction, target: &Placement, now: u64) -> StateResult<bool> {
    let key = target.work_key();
    if current_version(txn, AUCTIONS, &key)?.is_some() {
        return Ok(false);
    }
    let request = AuctionRequest {
        target: target.clone(),
        requested_at: now,
    };
    put_in(txn, AUCTIONS, &key, &request)?;
    Ok(true)
}

fn check_fence(txn: &WriteTransaction, lock: &str, term: Term) -> StateResult<()> {
    let lease: Option<Versioned<LeaseRecord>> = get_in(txn, LEASES, lock)?;
    match lease {
        Some(lease) if lease.value.term == term && lease.value.is_live(epoch_millis()) => Ok(()),
        Some(lease) => Err(StateError::Fenced(format!(
            "{lock}: term {term} is not live (current term {})",
            lease.value.term
        ))),
        None => Err(StateError::Fenced(format!("{lock}: no lease"))),
    }
}

fn keys_with_prefix(txn: &WriteTransaction, def: JsonTable, prefix: &str) -> StateResult<Vec<String>> {
    let table = txn.open_table(def).map_err(map_err!(Table))?;
    let mut keys = Vec::new();
    for entry in table.range(prefix..).map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        keys.push(key.to_string());
    }
    Ok(keys)
}

fn get_from<T: DeserializeOwned>(
    txn: &ReadTransaction,
    def: JsonTable,
    key: &str,
) -> StateResult<Option<Versioned<T>>> {
    let table = txn.open_table(def).map_err(map_err!(Table))?;
    let found = match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Some(decode(guard.value())?),
        None => None,
    };
    Ok(found)
}

/// Key-ordered scan of every entry whose key starts with `prefix`.
fn scan<T: DeserializeOwned>(
    txn: &ReadTransaction,
    def: JsonTable,
    prefix: &str,
) -> StateResult<Vec<Versioned<T>>> {
    let table = txn.open_table(def).map_err(map_err!(Table))?;
    let mut results = Vec::new();
    for entry in table.range(prefix..).map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if !key.value().starts_with(prefix) {
            break;
        }
        results.push(decode(value.value())?);
    }
    Ok(results)
}
