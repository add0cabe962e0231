//! Carrying out intents against the store.
//!
//! Every write is conditional on the version the intent was planned
//! against. A write that loses a race is counted and skipped; the next
//! pass recomputes from fresh state.

use cellgrid_state::{StateError, StateStore, Term, Work, WorkOrder, epoch_millis};
use tracing::{debug, info, warn};

use crate::error::ConvergeResult;
use crate::plan::Intent;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub conflicts: usize,
    /// The lease moved on; the remaining intents were abandoned.
    pub fenced: bool,
}

/// Apply `intents` in order as the holder of `lock` at `term`.
pub fn apply(
    store: &StateStore,
    lock: &str,
    term: Term,
    intents: Vec<Intent>,
) -> ConvergeResult<ApplyReport> {
    apply_while(store, lock, term, intents, || true)
}

/// Like [`apply`], but asks `leading` before every intent and abandons the
/// rest of the pass as soon as it says no.
pub fn apply_while(
    store: &StateStore,
    lock: &str,
    term: Term,
    intents: Vec<Intent>,
    mut leading: impl FnMut() -> bool,
) -> ConvergeResult<ApplyReport> {
    let mut report = ApplyReport::default();
    for intent in intents {
        if !leading() {
            warn!(term, "lease lapsed mid-pass, abandoning");
            report.fenced = true;
            break;
        }
        match apply_one(store, lock, term, &intent) {
            Ok(()) => report.applied += 1,
            Err(StateError::Fenced(reason)) => {
                warn!(term, %reason, "convergence fenced, abandoning pass");
                report.fenced = true;
                break;
            }
            Err(e) if e.is_conflict() => {
                debug!(?intent, error = %e, "intent skipped");
                report.conflicts += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(report)
}

fn apply_one(store: &StateStore, lock: &str, term: Term, intent: &Intent) -> Result<(), StateError> {
    match intent {
        Intent::RequestAuction { target } => {
            if store.request_auction(target)? {
                info!(key = %target.work_key(), "requested auction");
            }
        }
        Intent::StopInstance {
            cell_id,
            process_guid,
            index,
            instance_guid,
        } => {
            let order = WorkOrder {
                cell_id: cell_id.clone(),
                work: Work::Stop {
                    process_guid: process_guid.clone(),
                    index: *index,
                    instance_guid: instance_guid.clone(),
                },
                term,
                issued_at: epoch_millis(),
            };
            store.create_order(lock, &order)?;
            info!(%cell_id, %process_guid, index, %instance_guid, "stop ordered");
        }
        Intent::RemoveActual {
            process_guid,
            index,
            version,
            reason,
        } => {
            store.remove_actual(process_guid, *index, *version)?;
            info!(%process_guid, index, reason, "actual instance removed");
        }
        Intent::ExpireCell { cell_id, version } => {
            store.remove_cell(cell_id, *version)?;
            warn!(%cell_id, "cell expired");
        }
        Intent::CancelOrder {
            cell_id,
            work_key,
            version,
        } => {
            store.remove_order(cell_id, work_key, *version)?;
            info!(%cell_id, %work_key, "order cancelled");
        }
        Intent::DropAuction { work_key, version } => {
            store.remove_auction_request(work_key, *version)?;
            debug!(%work_key, "auction request dropped");
        }
        Intent::FailTask {
            task_guid,
            version,
            reason,
        } => {
            let Some(current) = store.get_task(task_guid)? else {
                return Err(StateError::NotFound(task_guid.clone()));
            };
            if current.version != *version {
                return Err(StateError::Conflict(task_guid.clone()));
            }
            let failed = current
                .value
                .completed(Err(reason.to_string()), epoch_millis());
            store.compare_and_swap_task(task_guid, *version, &failed)?;
            info!(%task_guid, reason, "task failed");
        }
        Intent::RemoveTask { task_guid, version } => {
            store.remove_task(task_guid, *version)?;
            debug!(%task_guid, "completed task removed");
        }
    }
    Ok(())
}
