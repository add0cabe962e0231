//! Domain types for the cellgrid state store.
//!
//! Desired workloads (LRPs and tasks), actual instances, cell presence
//! records, work orders, auction requests and leases. Every type is
//! serialized to JSON inside a [`Versioned`] envelope before it lands in a
//! redb table.

use serde::{Deserialize, Serialize};

/// Store-wide monotonically increasing write stamp.
pub type Version = u64;

/// Lease term, bumped on every change of owner.
pub type Term = u64;

/// A stored value together with the version stamp of the write that
/// produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: Version,
    pub value: T,
}

/// Precondition for a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    /// The key must not exist.
    Absent,
    /// The key must exist at exactly this version.
    Version(Version),
}

// ── Desired state ──────────────────────────────────────────────────

/// Per-container resource quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub memory_mb: u64,
    pub disk_mb: u64,
    #[serde(default = "default_file_descriptors")]
    pub file_descriptors: u64,
}

fn default_file_descriptors() -> u64 {
    1024
}

/// Name/value pair handed to a `run` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One unit of work inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Run a shell script inside the container sandbox.
    Run {
        script: String,
        #[serde(default)]
        env: Vec<EnvVar>,
    },
    /// Fetch an artifact into the sandbox, optionally unpacking a `.tar.gz`.
    Download {
        from: String,
        to: String,
        #[serde(default)]
        extract: bool,
    },
    /// Post a gzipped tarball of a sandbox file to a URL.
    Upload { from: String, to: String },
    /// Capture a sandbox file as the task result.
    FetchResult { file: String },
}

impl Action {
    pub fn run(script: impl Into<String>) -> Self {
        Action::Run {
            script: script.into(),
            env: Vec::new(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Action::Run { .. } => "run",
            Action::Download { .. } => "download",
            Action::Upload { .. } => "upload",
            Action::FetchResult { .. } => "fetch_result",
        }
    }
}

/// An action with an optional timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Step {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            timeout_ms: None,
        }
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }
}

/// Tag attached to every line of container output.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogConfig {
    pub guid: String,
    pub source_name: String,
}

/// A long-running process kept at `instances` copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredLrp {
    pub process_guid: String,
    pub stack: String,
    pub resources: ResourceRequest,
    /// Setup steps followed by the long-running step (the last one).
    pub actions: Vec<Step>,
    pub instances: u32,
    #[serde(default)]
    pub routes: Vec<String>,
    #[serde(default)]
    pub log: LogConfig,
    /// Epoch millis.
    pub created_at: u64,
}

/// Task lifecycle. A task never goes back to an earlier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
}

/// A one-shot workload run to completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_guid: String,
    pub stack: String,
    pub resources: ResourceRequest,
    pub actions: Vec<Step>,
    #[serde(default)]
    pub log: LogConfig,
    pub state: TaskState,
    #[serde(default)]
    pub cell_id: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default)]
    pub completed_at: Option<u64>,
}

impl Task {
    /// A fresh pending task.
    pub fn new(
        task_guid: impl Into<String>,
        stack: impl Into<String>,
        resources: ResourceRequest,
        actions: Vec<Step>,
    ) -> Self {
        let now = epoch_millis();
        Self {
            task_guid: task_guid.into(),
            stack: stack.into(),
            resources,
            actions,
            log: LogConfig::default(),
            state: TaskState::Pending,
            cell_id: None,
            result: None,
            failed: false,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Move to `Running` on `cell_id`.
    pub fn started_on(mut self, cell_id: &str, now: u64) -> Self {
        self.state = TaskState::Running;
        self.cell_id = Some(cell_id.to_string());
        self.updated_at = now;
        self
    }

    /// Move to `Completed` with either a result or a failure reason.
    pub fn completed(mut self, outcome: Result<Option<String>, String>, now: u64) -> Self {
        self.state = TaskState::Completed;
        match outcome {
            Ok(result) => {
                self.result = result;
                self.failed = false;
                self.failure_reason = None;
            }
            Err(reason) => {
                self.result = None;
                self.failed = true;
                self.failure_reason = Some(reason);
            }
        }
        self.updated_at = now;
        self.completed_at = Some(now);
        self
    }
}

/// Either kind of desired workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DesiredWorkload {
    Lrp(DesiredLrp),
    Task(Task),
}

impl DesiredWorkload {
    pub fn guid(&self) -> &str {
        match self {
            DesiredWorkload::Lrp(lrp) => &lrp.process_guid,
            DesiredWorkload::Task(task) => &task.task_guid,
        }
    }

    pub fn stack(&self) -> &str {
        match self {
            DesiredWorkload::Lrp(lrp) => &lrp.stack,
            DesiredWorkload::Task(task) => &task.stack,
        }
    }

    pub fn resources(&self) -> &ResourceRequest {
        match self {
            DesiredWorkload::Lrp(lrp) => &lrp.resources,
            DesiredWorkload::Task(task) => &task.resources,
        }
    }

    pub fn actions(&self) -> &[Step] {
        match self {
            DesiredWorkload::Lrp(lrp) => &lrp.actions,
            DesiredWorkload::Task(task) => &task.actions,
        }
    }
}

// ── Actual state ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActualState {
    Starting,
    Running,
    Crashed,
}

/// One running (or starting, or crashed) copy of an LRP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActualInstance {
    pub process_guid: String,
    pub index: u32,
    pub instance_guid: String,
    pub cell_id: String,
    pub state: ActualState,
    #[serde(default)]
    pub crash_reason: Option<String>,
    /// Epoch millis of the last state change.
    pub since: u64,
}

impl ActualInstance {
    pub fn table_key(&self) -> String {
        actual_key(&self.process_guid, self.index)
    }
}

pub fn actual_key(process_guid: &str, index: u32) -> String {
    format!("{process_guid}/{index:010}")
}

// ── Cells ──────────────────────────────────────────────────────────

/// Memory, disk, file-descriptor and container counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capacity {
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub file_descriptors: u64,
    pub containers: u32,
}

impl Capacity {
    pub fn new(memory_mb: u64, disk_mb: u64, file_descriptors: u64, containers: u32) -> Self {
        Self {
            memory_mb,
            disk_mb,
            file_descriptors,
            containers,
        }
    }

    /// True when one container with `req` fits.
    pub fn fits(&self, req: &ResourceRequest) -> bool {
        self.containers >= 1
            && self.memory_mb >= req.memory_mb
            && self.disk_mb >= req.disk_mb
            && self.file_descriptors >= req.file_descriptors
    }

    /// Capacity left after placing one container with `req`.
    pub fn minus(&self, req: &ResourceRequest) -> Capacity {
        Capacity {
            memory_mb: self.memory_mb.saturating_sub(req.memory_mb),
            disk_mb: self.disk_mb.saturating_sub(req.disk_mb),
            file_descriptors: self.file_descriptors.saturating_sub(req.file_descriptors),
            containers: self.containers.saturating_sub(1),
        }
    }
}

/// Presence record published by a cell agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRecord {
    pub cell_id: String,
    pub stack: String,
    pub total: Capacity,
    pub available: Capacity,
    /// Epoch millis of the last heartbeat.
    pub heartbeat_at: u64,
}

impl CellRecord {
    /// Whether the last heartbeat is within `ttl_ms` of `now`.
    pub fn is_fresh(&self, now: u64, ttl_ms: u64) -> bool {
        now.saturating_sub(self.heartbeat_at) <= ttl_ms
    }
}

// ── Work orders and auctions ───────────────────────────────────────

/// Something the auctioneer can place.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Placement {
    Lrp { process_guid: String, index: u32 },
    Task { task_guid: String },
}

impl Placement {
    pub fn lrp(process_guid: impl Into<String>, index: u32) -> Self {
        Placement::Lrp {
            process_guid: process_guid.into(),
            index,
        }
    }

    pub fn task(task_guid: impl Into<String>) -> Self {
        Placement::Task {
            task_guid: task_guid.into(),
        }
    }

    pub fn work_key(&self) -> String {
        match self {
            Placement::Lrp {
                process_guid,
                index,
            } => format!("lrp/{process_guid}/{index:010}"),
            Placement::Task { task_guid } => format!("task/{task_guid}"),
        }
    }
}

/// The instruction carried by a [`WorkOrder`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Work {
    Start(Placement),
    Stop {
        process_guid: String,
        index: u32,
        instance_guid: String,
    },
}

impl Work {
    pub fn work_key(&self) -> String {
        match self {
            Work::Start(placement) => placement.work_key(),
            Work::Stop {
                process_guid,
                index,
                ..
            } => format!("stop/{process_guid}/{index:010}"),
        }
    }
}

/// An instruction addressed to one cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOrder {
    pub cell_id: String,
    pub work: Work,
    /// Term of the leader that issued the order.
    pub term: Term,
    pub issued_at: u64,
}

impl WorkOrder {
    pub fn table_key(&self) -> String {
        order_key(&self.cell_id, &self.work.work_key())
    }
}

pub fn order_key(cell_id: &str, work_key: &str) -> String {
    format!("{cell_id}/{work_key}")
}

/// A placement waiting for the auctioneer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuctionRequest {
    pub target: Placement,
    pub requested_at: u64,
}

// ── Leases ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub name: String,
    pub owner: String,
    pub term: Term,
    /// Epoch millis after which the lease may be taken over.
    pub expires_at: u64,
}

impl LeaseRecord {
    pub fn is_live(&self, now: u64) -> bool {
        self.expires_at > now
    }
}

// ── Snapshot ───────────────────────────────────────────────────────

/// Every table as of a single read transaction, each list in key order.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub taken_at: u64,
    pub desired_lrps: Vec<Versioned<DesiredLrp>>,
    pub tasks: Vec<Versioned<Task>>,
    pub actual: Vec<Versioned<ActualInstance>>,
    pub cells: Vec<Versioned<CellRecord>>,
    pub orders: Vec<Versioned<WorkOrder>>,
    pub auctions: Vec<Versioned<AuctionRequest>>,
}

impl Snapshot {
    pub fn desired_lrp(&self, process_guid: &str) -> Option<&Versioned<DesiredLrp>> {
        self.desired_lrps
            .iter()
            .find(|d| d.value.process_guid == process_guid)
    }

    pub fn task(&self, task_guid: &str) -> Option<&Versioned<Task>> {
        self.tasks.iter().find(|t| t.value.task_guid == task_guid)
    }

    pub fn cell(&self, cell_id: &str) -> Option<&Versioned<CellRecord>> {
        self.cells.iter().find(|c| c.value.cell_id == cell_id)
    }

    pub fn actual_at(&self, process_guid: &str, index: u32) -> Option<&Versioned<ActualInstance>> {
        self.actual
            .iter()
            .find(|a| a.value.process_guid == process_guid && a.value.index == index)
    }
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
