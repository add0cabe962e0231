//! The auctioneer loop.
//!
//! Runs a round on every tick while this replica holds the auctioneer
//! lease. Orders are written with the lease term; the store refuses them
//! once a newer term exists, so a deposed auctioneer cannot place work.

use std::sync::Arc;
use std::time::Duration;

use cellgrid_lock::{AUCTIONEER_LOCK, LeaderHandle};
use cellgrid_state::{StateError, StateStore, Work, WorkOrder, epoch_millis};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::AuctionResult;
use crate::placer::plan_round;
use crate::scorer::{BidStrategy, LeastLoaded};

#[derive(Debug, Clone)]
pub struct AuctioneerConfig {
    /// Time between rounds.
    pub interval: Duration,
    /// Cells whose heartbeat is older than this do not bid.
    pub cell_ttl: Duration,
}

impl Default for AuctioneerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            cell_ttl: Duration::from_secs(5),
        }
    }
}

/// Counts from one applied round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub awarded: usize,
    pub dropped: usize,
    pub unplaced: usize,
    /// Awards that lost a race with another writer.
    pub conflicts: usize,
}

pub struct Auctioneer {
    store: StateStore,
    leader: LeaderHandle,
    strategy: Arc<dyn BidStrategy>,
    config: AuctioneerConfig,
}

impl Auctioneer {
    pub fn new(store: StateStore, leader: LeaderHandle, config: AuctioneerConfig) -> Self {
        Self {
            store,
            leader,
            strategy: Arc::new(LeastLoaded::default()),
            config,
        }
    }

    /// Replace the default [`LeastLoaded`] strategy.
    pub fn with_strategy(mut self, strategy: Arc<dyn BidStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Plan and apply one round. Returns `None` when not leading.
    pub fn run_round(&self) -> AuctionResult<Option<RoundReport>> {
        let Some(term) = self.leader.current_term() else {
            return Ok(None);
        };
        let snapshot = self.store.snapshot()?;
        let plan = plan_round(
            &snapshot,
            self.strategy.as_ref(),
            self.config.cell_ttl.as_millis() as u64,
        );

        let mut report = RoundReport {
            unplaced: plan.unplaced.len(),
            ..Default::default()
        };

        for award in plan.awards {
            let order = WorkOrder {
                cell_id: award.cell_id,
                work: Work::Start(award.request.value.target.clone()),
                term,
                issued_at: epoch_millis(),
            };
            match self
                .store
                .award_auction(AUCTIONEER_LOCK, &order, award.request.version)
            {
                Ok(_) => {
                    info!(
                        key = %order.work.work_key(),
                        cell_id = %order.cell_id,
                        term,
                        "work order issued"
                    );
                    report.awarded += 1;
                }
                Err(StateError::Fenced(reason)) => {
                    warn!(term, %reason, "auction round fenced, abandoning");
                    return Ok(Some(report));
                }
                Err(e) if e.is_conflict() => {
                    debug!(key = %order.work.work_key(), error = %e, "award lost race");
                    report.conflicts += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        for request in plan.dropped {
            let key = request.value.target.work_key();
            match self.store.remove_auction_request(&key, request.version) {
                Ok(()) => report.dropped += 1,
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e.into()),
            }
        }

        if report != RoundReport::default() {
            debug!(?report, "auction round applied");
        }
        Ok(Some(report))
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            strategy = self.strategy.name(),
            "auctioneer started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.run_round() {
                        warn!(error = %e, "auction round failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("auctioneer shutting down");
                    break;
                }
            }
        }
    }
}
