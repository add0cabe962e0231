//! The desired/actual diff.
//!
//! [`plan`] is a pure function of a snapshot and the current time. It
//! never writes; every intent carries the version it was computed
//! against so that [`apply`](crate::apply) can skip anything that changed
//! in the meantime.

use std::collections::HashSet;

use cellgrid_state::{
    ActualState, Placement, Snapshot, TaskState, Version, Work,
};

/// Timing knobs for the diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    /// Cells whose heartbeat is older than this are dead.
    pub cell_ttl_ms: u64,
    /// How long completed tasks are kept before removal.
    pub task_retention_ms: u64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            cell_ttl_ms: 5_000,
            task_retention_ms: 120_000,
        }
    }
}

pub const CELL_DISAPPEARED: &str = "cell disappeared before task completed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// Queue a placement for the auctioneer.
    RequestAuction { target: Placement },
    /// Order a live cell to stop an instance nobody wants.
    StopInstance {
        cell_id: String,
        process_guid: String,
        index: u32,
        instance_guid: String,
    },
    RemoveActual {
        process_guid: String,
        index: u32,
        version: Version,
        reason: &'static str,
    },
    ExpireCell { cell_id: String, version: Version },
    /// Withdraw an order addressed to a dead cell.
    CancelOrder {
        cell_id: String,
        work_key: String,
        version: Version,
    },
    DropAuction { work_key: String, version: Version },
    FailTask {
        task_guid: String,
        version: Version,
        reason: &'static str,
    },
    RemoveTask { task_guid: String, version: Version },
}

impl Intent {
    /// Application order: clear stale records before queueing new work.
    fn rank(&self) -> u8 {
        match self {
            Intent::ExpireCell { .. } => 0,
            Intent::CancelOrder { .. } => 1,
            Intent::RemoveActual { .. } => 2,
            Intent::DropAuction { .. } => 3,
            Intent::FailTask { .. } => 4,
            Intent::RemoveTask { .. } => 5,
            Intent::StopInstance { .. } => 6,
            Intent::RequestAuction { .. } => 7,
        }
    }
}

/// Compute the intents that move `snapshot` toward its desired state.
pub fn plan(snapshot: &Snapshot, now: u64, policy: &Policy) -> Vec<Intent> {
    let live: HashSet<&str> = snapshot
        .cells
        .iter()
        .filter(|c| c.value.is_fresh(now, policy.cell_ttl_ms))
        .map(|c| c.value.cell_id.as_str())
        .collect();
    let mut intents = Vec::new();

    for cell in &snapshot.cells {
        if !live.contains(cell.value.cell_id.as_str()) {
            intents.push(Intent::ExpireCell {
                cell_id: cell.value.cell_id.clone(),
                version: cell.version,
            });
        }
    }

    // Work keys already in flight: an order to a live cell or a queued
    // auction request.
    let mut covered: HashSet<String> = HashSet::new();
    let mut stopping: HashSet<String> = HashSet::new();
    for order in &snapshot.orders {
        let key = order.value.work.work_key();
        if !live.contains(order.value.cell_id.as_str()) {
            intents.push(Intent::CancelOrder {
                cell_id: order.value.cell_id.clone(),
                work_key: key,
                version: order.version,
            });
            continue;
        }
        match &order.value.work {
            Work::Start(target) => {
                covered.insert(target.work_key());
            }
            Work::Stop { instance_guid, .. } => {
                stopping.insert(instance_guid.clone());
            }
        }
    }

    for request in &snapshot.auctions {
        let target = &request.value.target;
        let wanted = match target {
            Placement::Lrp {
                process_guid,
                index,
            } => snapshot
                .desired_lrp(process_guid)
                .is_some_and(|d| *index < d.value.instances),
            Placement::Task { task_guid } => snapshot
                .task(task_guid)
                .is_some_and(|t| t.value.state == TaskState::Pending),
        };
        if wanted {
            covered.insert(target.work_key());
        } else {
            intents.push(Intent::DropAuction {
                work_key: target.work_key(),
                version: request.version,
            });
        }
    }

    // ── Instances ──

    let mut occupied: HashSet<String> = HashSet::new();
    for actual in &snapshot.actual {
        let a = &actual.value;
        if !live.contains(a.cell_id.as_str()) {
            intents.push(Intent::RemoveActual {
                process_guid: a.process_guid.clone(),
                index: a.index,
                version: actual.version,
                reason: "cell gone",
            });
            continue;
        }
        let desired = snapshot
            .desired_lrp(&a.process_guid)
            .is_some_and(|d| a.index < d.value.instances);
        if !desired {
            if a.state == ActualState::Crashed {
                intents.push(Intent::RemoveActual {
                    process_guid: a.process_guid.clone(),
                    index: a.index,
                    version: actual.version,
                    reason: "crashed and no longer desired",
                });
            } else if !stopping.contains(&a.instance_guid) {
                intents.push(Intent::StopInstance {
                    cell_id: a.cell_id.clone(),
                    process_guid: a.process_guid.clone(),
                    index: a.index,
                    instance_guid: a.instance_guid.clone(),
                });
            }
            continue;
        }
        if a.state == ActualState::Crashed {
            intents.push(Intent::RemoveActual {
                process_guid: a.process_guid.clone(),
                index: a.index,
                version: actual.version,
                reason: "crashed",
            });
            continue;
        }
        occupied.insert(Placement::lrp(&a.process_guid, a.index).work_key());
    }

    for desired in &snapshot.desired_lrps {
        for index in 0..desired.value.instances {
            let target = Placement::lrp(&desired.value.process_guid, index);
            let key = target.work_key();
            if !occupied.contains(&key) && !covered.contains(&key) {
                intents.push(Intent::RequestAuction { target });
            }
        }
    }

    // ── Tasks ──

    for task in &snapshot.tasks {
        let t = &task.value;
        match t.state {
            TaskState::Pending => {
                // Unplaceable tasks wait for capacity; they are never failed here.
                let target = Placement::task(&t.task_guid);
                if !covered.contains(&target.work_key()) {
                    intents.push(Intent::RequestAuction { target });
                }
            }
            TaskState::Running => {
                let on_live_cell = t
                    .cell_id
                    .as_deref()
                    .is_some_and(|cell| live.contains(cell));
                if !on_live_cell {
                    intents.push(Intent::FailTask {
                        task_guid: t.task_guid.clone(),
                        version: task.version,
                        reason: CELL_DISAPPEARED,
                    });
                }
            }
            TaskState::Completed => {
                let done_at = t.completed_at.unwrap_or(t.updated_at);
                if now.saturating_sub(done_at) > policy.task_retention_ms {
                    intents.push(Intent::RemoveTask {
                        task_guid: t.task_guid.clone(),
                        version: task.version,
                    });
                }
            }
        }
    }

    intents.sort_by_key(Intent::rank);
    intents
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellgrid_state::*;

    const NOW: u64 = 1_000_000;

    fn policy() -> Policy {
        Policy {
            cell_ttl_ms: 5_000,
            task_retention_ms: 60_000,
        }
    }

    fn v<T>(version: Version, value: T) -> Versioned<T> {
        Versioned { version, value }
    }

    fn cell(id: &str, heartbeat_at: u64) -> Versioned<CellRecord> {
        v(
            1,
            CellRecord {
                cell_id: id.to_string(),
                stack: "linux".to_string(),
                total: Capacity::new(1024, 1024, 8192, 8),
                available: Capacity::new(1024, 1024, 8192, 8),
                heartbeat_at,
            },
        )
    }

    fn lrp(guid: &str, instances: u32) -> Versioned<DesiredLrp> {
        v(
            2,
            DesiredLrp {
                process_guid: guid.to_string(),
                stack: "linux".to_string(),
                resources: ResourceRequest {
                    memory_mb: 64,
                    disk_mb: 64,
                    file_descriptors: 64,
                },
                actions: vec![Step::new(Action::run("sleep 3600"))],
                instances,
                routes: vec![],
                log: LogConfig::default(),
                created_at: 0,
            },
        )
    }

    fn actual(guid: &str, index: u32, cell: &str, state: ActualState) -> Versioned<ActualInstance> {
        v(
            3,
            ActualInstance {
                process_guid: guid.to_string(),
                index,
                instance_guid: format!("{guid}-{index}-{cell}"),
                cell_id: cell.to_string(),
                state,
                crash_reason: None,
                since: 0,
            },
        )
    }

    fn auctions(intents: &[Intent]) -> Vec<String> {
        intents
            .iter()
            .filter_map(|i| match i {
                Intent::RequestAuction { target } => Some(target.work_key()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn converged_state_needs_nothing() {
        let snapshot = Snapshot {
            cells: vec![cell("c1", NOW)],
            desired_lrps: vec![lrp("web", 2)],
            actual: vec![
                actual("web", 0, "c1", ActualState::Running),
                actual("web", 1, "c1", ActualState::Starting),
            ],
            ..Default::default()
        };
        assert!(plan(&snapshot, NOW, &policy()).is_empty());
    }

    #[test]
    fn missing_slots_are_requested_once() {
        let mut snapshot = Snapshot {
            cells: vec![cell("c1", NOW)],
            desired_lrps: vec![lrp("web", 3)],
            actual: vec![actual("web", 0, "c1", ActualState::Running)],
            ..Default::default()
        };
        snapshot.auctions.push(v(
            5,
            AuctionRequest {
                target: Placement::lrp("web", 2),
                requested_at: 0,
            },
        ));
        let intents = plan(&snapshot, NOW, &policy());
        assert_eq!(auctions(&intents), vec![Placement::lrp("web", 1).work_key()]);
    }

    #[test]
    fn dead_cell_is_cleaned_up_and_work_rescheduled() {
        let snapshot = Snapshot {
            cells: vec![cell("c1", NOW), cell("dead", NOW - 10_000)],
            desired_lrps: vec![lrp("web", 1)],
            actual: vec![actual("web", 0, "dead", ActualState::Running)],
            ..Default::default()
        };
        let intents = plan(&snapshot, NOW, &policy());
        assert!(matches!(&intents[0], Intent::ExpireCell { cell_id, .. } if cell_id == "dead"));
        assert!(intents.iter().any(|i| matches!(i,
            Intent::RemoveActual { reason: "cell gone", .. })));
        assert_eq!(auctions(&intents), vec![Placement::lrp("web", 0).work_key()]);
    }

    #[test]
    fn orders_to_dead_cells_are_cancelled_and_requeued() {
        let mut snapshot = Snapshot {
            desired_lrps: vec![lrp("web", 1)],
            ..Default::default()
        };
        snapshot.orders.push(v(
            7,
            WorkOrder {
                cell_id: "gone".to_string(),
                work: Work::Start(Placement::lrp("web", 0)),
                term: 1,
                issued_at: 0,
            },
        ));
        let intents = plan(&snapshot, NOW, &policy());
        assert_eq!(
            intents[0],
            Intent::CancelOrder {
                cell_id: "gone".to_string(),
                work_key: "lrp/web/0000000000".to_string(),
                version: 7,
            }
        );
        assert_eq!(auctions(&intents).len(), 1);
    }

    #[test]
    fn crashed_instances_are_replaced() {
        let snapshot = Snapshot {
            cells: vec![cell("c1", NOW)],
            desired_lrps: vec![lrp("web", 1)],
            actual: vec![actual("web", 0, "c1", ActualState::Crashed)],
            ..Default::default()
        };
        let intents = plan(&snapshot, NOW, &policy());
        assert!(matches!(intents[0], Intent::RemoveActual { reason: "crashed", .. }));
        assert_eq!(auctions(&intents).len(), 1);
    }

    #[test]
    fn extra_instances_are_stopped_once() {
        let mut snapshot = Snapshot {
            cells: vec![cell("c1", NOW)],
            desired_lrps: vec![lrp("web", 1)],
            actual: vec![
                actual("web", 0, "c1", ActualState::Running),
                actual("web", 1, "c1", ActualState::Running),
                actual("gone", 0, "c1", ActualState::Running),
            ],
            ..Default::default()
        };
        let intents = plan(&snapshot, NOW, &policy());
        let stops: Vec<_> = intents
            .iter()
            .filter(|i| matches!(i, Intent::StopInstance { .. }))
            .collect();
        assert_eq!(stops.len(), 2);

        // A pending stop order suppresses a second one.
        snapshot.orders.push(v(
            9,
            WorkOrder {
                cell_id: "c1".to_string(),
                work: Work::Stop {
                    process_guid: "web".to_string(),
                    index: 1,
                    instance_guid: "web-1-c1".to_string(),
                },
                term: 1,
                issued_at: 0,
            },
        ));
        let intents = plan(&snapshot, NOW, &policy());
        assert_eq!(
            intents
                .iter()
                .filter(|i| matches!(i, Intent::StopInstance { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn stale_auction_requests_are_dropped() {
        let snapshot = Snapshot {
            desired_lrps: vec![lrp("web", 1)],
            auctions: vec![
                v(4, AuctionRequest { target: Placement::lrp("web", 0), requested_at: 0 }),
                v(5, AuctionRequest { target: Placement::lrp("web", 3), requested_at: 0 }),
                v(6, AuctionRequest { target: Placement::task("nope"), requested_at: 0 }),
            ],
            ..Default::default()
        };
        let intents = plan(&snapshot, NOW, &policy());
        let dropped: Vec<_> = intents
            .iter()
            .filter_map(|i| match i {
                Intent::DropAuction { work_key, .. } => Some(work_key.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(dropped, vec!["lrp/web/0000000003", "task/nope"]);
    }

    fn task(guid: &str, state: TaskState, cell: Option<&str>, at: u64) -> Versioned<Task> {
        let mut t = Task::new(guid, "linux", lrp("x", 1).value.resources, vec![]);
        t.state = state;
        t.cell_id = cell.map(str::to_string);
        t.created_at = at;
        t.updated_at = at;
        if state == TaskState::Completed {
            t.completed_at = Some(at);
        }
        v(8, t)
    }

    #[test]
    fn task_lifecycle_repairs() {
        let snapshot = Snapshot {
            cells: vec![cell("c1", NOW)],
            tasks: vec![
                task("fresh", TaskState::Pending, None, NOW),
                task("ancient", TaskState::Pending, None, NOW - 700_000),
                task("orphan", TaskState::Running, Some("gone"), NOW),
                task("healthy", TaskState::Running, Some("c1"), NOW),
                task("old", TaskState::Completed, Some("c1"), NOW - 61_000),
                task("recent", TaskState::Completed, Some("c1"), NOW - 1_000),
            ],
            ..Default::default()
        };
        let intents = plan(&snapshot, NOW, &policy());
        assert_eq!(
            auctions(&intents),
            vec!["task/fresh".to_string(), "task/ancient".to_string()]
        );
        assert!(intents.contains(&Intent::FailTask {
            task_guid: "orphan".to_string(),
            version: 8,
            reason: CELL_DISAPPEARED,
        }));
        assert!(intents.contains(&Intent::RemoveTask {
            task_guid: "old".to_string(),
            version: 8,
        }));
        assert_eq!(intents.len(), 4);
    }

    #[test]
    fn unplaceable_task_is_retried_not_failed() {
        let store = StateStore::open_in_memory().unwrap();
        let resources = lrp("x", 1).value.resources;
        let mut t = Task::new("t1", "linux", resources, vec![Step::new(Action::run("true"))]);
        t.created_at = 0;
        t.updated_at = 0;
        store.create_desired(&DesiredWorkload::Task(t)).unwrap();

        let mut now = epoch_millis();
        for _ in 0..3 {
            // No cells ever show up; the request keeps getting rebuilt.
            let queued = store.list_auction_requests().unwrap();
            for request in queued {
                store
                    .remove_auction_request(&request.value.target.work_key(), request.version)
                    .unwrap();
            }
            let intents = plan(&store.snapshot().unwrap(), now, &Policy::default());
            assert_eq!(
                intents,
                vec![Intent::RequestAuction {
                    target: Placement::task("t1")
                }]
            );
            store.request_auction(&Placement::task("t1")).unwrap();
            now += 24 * 60 * 60 * 1000;
        }
        let task = store.get_task("t1").unwrap().unwrap().value;
        assert_eq!(task.state, TaskState::Pending);
    }
}
