//! Round planning: every award for one snapshot.
//!
//! Requests are considered in work-key order. Capacity awarded earlier in
//! the round is subtracted before later requests are scored, so a single
//! round never oversubscribes a cell.

use std::collections::HashSet;

use cellgrid_state::{AuctionRequest, Placement, Snapshot, TaskState, Versioned, Work};
use tracing::debug;

use crate::convert::{fleet_view, placement_requirements};
use crate::scorer::{BidStrategy, rank_cells};

/// A request and the cell that won it.
#[derive(Debug, Clone)]
pub struct Award {
    pub request: Versioned<AuctionRequest>,
    pub cell_id: String,
    pub score: f64,
}

/// Outcome of planning one round.
#[derive(Debug, Clone, Default)]
pub struct RoundPlan {
    pub awards: Vec<Award>,
    /// Requests whose target is gone or already placed.
    pub dropped: Vec<Versioned<AuctionRequest>>,
    /// Work keys with no eligible cell; they stay queued.
    pub unplaced: Vec<String>,
}

/// Whether a queued placement still needs a cell.
fn still_wanted(snapshot: &Snapshot, target: &Placement, ordered: &HashSet<String>) -> bool {
    if ordered.contains(&target.work_key()) {
        return false;
    }
    match target {
        Placement::Lrp {
            process_guid,
            index,
        } => {
            let desired = snapshot
                .desired_lrp(process_guid)
                .is_some_and(|lrp| *index < lrp.value.instances);
            desired && snapshot.actual_at(process_guid, *index).is_none()
        }
        Placement::Task { task_guid } => snapshot
            .task(task_guid)
            .is_some_and(|task| task.value.state == TaskState::Pending),
    }
}

/// Plan the awards for every queued request in `snapshot`.
pub fn plan_round(snapshot: &Snapshot, strategy: &dyn BidStrategy, cell_ttl_ms: u64) -> RoundPlan {
    let mut cells = fleet_view(snapshot, cell_ttl_ms);
    let ordered: HashSet<String> = snapshot
        .orders
        .iter()
        .filter_map(|o| match &o.value.work {
            Work::Start(target) => Some(target.work_key()),
            Work::Stop { .. } => None,
        })
        .collect();

    let mut plan = RoundPlan::default();
    for request in &snapshot.auctions {
        let target = &request.value.target;
        let key = target.work_key();
        let requirements = placement_requirements(snapshot, target);
        let Some(req) = requirements.filter(|_| still_wanted(snapshot, target, &ordered)) else {
            debug!(%key, "auction request no longer needed");
            plan.dropped.push(request.clone());
            continue;
        };

        let bids = rank_cells(&cells, &req, strategy);
        let Some(best) = bids.first() else {
            debug!(%key, stack = %req.stack, memory_mb = req.resources.memory_mb, "no eligible cell");
            plan.unplaced.push(key);
            continue;
        };

        if let Some(cell) = cells.iter_mut().find(|c| c.cell_id == best.cell_id) {
            cell.commit(&req.resources, req.process_guid.as_deref());
        }
        debug!(%key, cell = %best.cell_id, score = best.score, strategy = strategy.name(), "auction won");
        plan.awards.push(Award {
            request: request.clone(),
            cell_id: best.cell_id.clone(),
            score: best.score,
        });
    }
    plan
}
