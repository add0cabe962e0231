//! Type conversions between state store types and auction types.
//!
//! Bridges `cellgrid_state::{CellRecord, DesiredLrp, Task}` to the
//! scorer's `CellResources` and `PlacementRequest`.

use std::collections::HashMap;

use cellgrid_state::{CellRecord, DesiredLrp, Placement, Snapshot, Task, Work};

use crate::scorer::{CellResources, PlacementRequest};

/// Convert a [`CellRecord`] to [`CellResources`] with no siblings counted.
pub fn cell_to_resources(cell: &CellRecord) -> CellResources {
    CellResources {
        cell_id: cell.cell_id.clone(),
        stack: cell.stack.clone(),
        total: cell.total,
        available: cell.available,
        process_instances: HashMap::new(),
    }
}

pub fn lrp_requirements(lrp: &DesiredLrp) -> PlacementRequest {
    PlacementRequest {
        process_guid: Some(lrp.process_guid.clone()),
        stack: lrp.stack.clone(),
        resources: lrp.resources,
    }
}

pub fn task_requirements(task: &Task) -> PlacementRequest {
    PlacementRequest {
        process_guid: None,
        stack: task.stack.clone(),
        resources: task.resources,
    }
}

/// Requirements for a placement whose desired record is still present.
pub fn placement_requirements(snapshot: &Snapshot, target: &Placement) -> Option<PlacementRequest> {
    match target {
        Placement::Lrp { process_guid, .. } => snapshot
            .desired_lrp(process_guid)
            .map(|lrp| lrp_requirements(&lrp.value)),
        Placement::Task { task_guid } => snapshot
            .task(task_guid)
            .map(|task| task_requirements(&task.value)),
    }
}

/// Fresh cells with outstanding start orders already subtracted and
/// running instances counted per process.
pub fn fleet_view(snapshot: &Snapshot, cell_ttl_ms: u64) -> Vec<CellResources> {
    let mut cells: Vec<CellResources> = snapshot
        .cells
        .iter()
        .filter(|c| c.value.is_fresh(snapshot.taken_at, cell_ttl_ms))
        .map(|c| cell_to_resources(&c.value))
        .collect();

    for actual in &snapshot.actual {
        if let Some(cell) = cells.iter_mut().find(|c| c.cell_id == actual.value.cell_id) {
            *cell
                .process_instances
                .entry(actual.value.process_guid.clone())
                .or_default() += 1;
        }
    }

    for order in &snapshot.orders {
        let Work::Start(target) = &order.value.work else {
            continue;
        };
        let Some(req) = placement_requirements(snapshot, target) else {
            continue;
        };
        if let Some(cell) = cells.iter_mut().find(|c| c.cell_id == order.value.cell_id) {
            cell.commit(&req.resources, req.process_guid.as_deref());
        }
    }

    cells
}
