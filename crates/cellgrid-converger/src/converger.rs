//! The converger loop.

use std::time::Duration;

use cellgrid_lock::{CONVERGER_LOCK, LeaderHandle};
use cellgrid_state::{StateStore, epoch_millis};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::apply::{ApplyReport, apply_while};
use crate::error::ConvergeResult;
use crate::plan::{Policy, plan};

#[derive(Debug, Clone)]
pub struct ConvergerConfig {
    pub interval: Duration,
    pub cell_ttl: Duration,
    pub task_retention: Duration,
}

impl Default for ConvergerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            cell_ttl: Duration::from_secs(5),
            task_retention: Duration::from_secs(120),
        }
    }
}

impl ConvergerConfig {
    pub fn policy(&self) -> Policy {
        Policy {
            cell_ttl_ms: self.cell_ttl.as_millis() as u64,
            task_retention_ms: self.task_retention.as_millis() as u64,
        }
    }
}

pub struct Converger {
    store: StateStore,
    leader: LeaderHandle,
    config: ConvergerConfig,
}

impl Converger {
    pub fn new(store: StateStore, leader: LeaderHandle, config: ConvergerConfig) -> Self {
        Self {
            store,
            leader,
            config,
        }
    }

    /// Run one diff-and-repair pass. Returns `None` when not leading.
    pub fn converge_once(&self) -> ConvergeResult<Option<ApplyReport>> {
        let Some(term) = self.leader.current_term() else {
            return Ok(None);
        };
        let snapshot = self.store.snapshot()?;
        let intents = plan(&snapshot, epoch_millis(), &self.config.policy());
        if intents.is_empty() {
            return Ok(Some(ApplyReport::default()));
        }
        debug!(term, intents = intents.len(), "converging");
        let report = apply_while(&self.store, CONVERGER_LOCK, term, intents, || {
            self.leader.current_term() == Some(term)
        })?;
        debug!(?report, "convergence pass applied");
        Ok(Some(report))
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "converger started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.converge_once() {
                        warn!(error = %e, "convergence pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("converger shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellgrid_lock::{ElectorConfig, LeaderElector};
    use cellgrid_state::*;

    fn desire(store: &StateStore, instances: u32) {
        store
            .create_desired(&DesiredWorkload::Lrp(DesiredLrp {
                process_guid: "web".to_string(),
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
            }))
            .unwrap();
    }

    fn elector(store: &StateStore) -> LeaderElector {
        LeaderElector::new(
            store.clone(),
            CONVERGER_LOCK,
            "me",
            ElectorConfig::with_ttl(Duration::from_secs(30)),
        )
        .unwrap()
    }

    #[test]
    fn idle_without_lease() {
        let store = StateStore::open_in_memory().unwrap();
        let elector = elector(&store);
        let converger = Converger::new(store, elector.handle(), ConvergerConfig::default());
        assert_eq!(converger.converge_once().unwrap(), None);
    }

    #[test]
    fn requeues_lost_requests() {
        let store = StateStore::open_in_memory().unwrap();
        desire(&store, 2);
        for request in store.list_auction_requests().unwrap() {
            store
                .remove_auction_request(&request.value.target.work_key(), request.version)
                .unwrap();
        }
        let elector = elector(&store);
        elector.tick().unwrap();

        let converger = Converger::new(store.clone(), elector.handle(), ConvergerConfig::default());
        let report = converger.converge_once().unwrap().unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(store.list_auction_requests().unwrap().len(), 2);

        let report = converger.converge_once().unwrap().unwrap();
        assert_eq!(report, ApplyReport::default());
    }
}
