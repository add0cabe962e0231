//! Spawning components as background tasks.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cellgrid_auction::{Auctioneer, AuctioneerConfig};
use cellgrid_cell::{CellAgent, CellConfig, Executor, LogSink, ProcessRuntime};
use cellgrid_converger::{Converger, ConvergerConfig};
use cellgrid_lock::{AUCTIONEER_LOCK, CONVERGER_LOCK, ElectorConfig, LeaderElector};
use cellgrid_state::StateStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// A running component: one or more tasks sharing a shutdown signal.
pub struct Component {
    name: String,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Component {
    fn new(name: impl Into<String>, shutdown: watch::Sender<bool>) -> Self {
        Self {
            name: name.into(),
            shutdown,
            tasks: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal shutdown and wait for every task to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!(component = %self.name, "stopped");
    }

    /// Abort without any cleanup, leaving store records behind as a crash
    /// would.
    pub fn kill(self) {
        for task in &self.tasks {
            task.abort();
        }
        info!(component = %self.name, "killed");
    }
}

/// Start a cell agent with sandboxes under `work_dir/<cell id>`.
pub fn spawn_cell(
    store: StateStore,
    config: CellConfig,
    work_dir: &Path,
    sink: Arc<dyn LogSink>,
) -> anyhow::Result<Component> {
    let cell_id = config.cell_id.clone();
    let runtime = ProcessRuntime::new(work_dir.join(&cell_id), sink);
    let agent = CellAgent::new(config, store, Executor::new(Arc::new(runtime)))?;

    let (shutdown, rx) = watch::channel(false);
    let mut component = Component::new(format!("cell {cell_id}"), shutdown);
    component.tasks.push(tokio::spawn(async move {
        if let Err(e) = agent.run(rx).await {
            error!(%cell_id, error = %e, "cell agent failed");
        }
    }));
    Ok(component)
}

/// Start an auctioneer competing for the auctioneer lease as `owner`.
pub fn spawn_auctioneer(
    store: StateStore,
    owner: &str,
    config: AuctioneerConfig,
    lease_ttl: Duration,
) -> anyhow::Result<Component> {
    let elector = LeaderElector::new(
        store.clone(),
        AUCTIONEER_LOCK,
        owner,
        ElectorConfig::with_ttl(lease_ttl),
    )?;
    let auctioneer = Auctioneer::new(store, elector.handle(), config);

    let (shutdown, rx) = watch::channel(false);
    let mut component = Component::new(format!("auctioneer {owner}"), shutdown);
    let elector_rx = rx.clone();
    component
        .tasks
        .push(tokio::spawn(async move { elector.run(elector_rx).await }));
    component
        .tasks
        .push(tokio::spawn(async move { auctioneer.run(rx).await }));
    Ok(component)
}

/// Start a converger competing for the converger lease as `owner`.
pub fn spawn_converger(
    store: StateStore,
    owner: &str,
    config: ConvergerConfig,
    lease_ttl: Duration,
) -> anyhow::Result<Component> {
    let elector = LeaderElector::new(
        store.clone(),
        CONVERGER_LOCK,
        owner,
        ElectorConfig::with_ttl(lease_ttl),
    )?;
    let converger = Converger::new(store, elector.handle(), config);

    let (shutdown, rx) = watch::channel(false);
    let mut component = Component::new(format!("converger {owner}"), shutdown);
    let elector_rx = rx.clone();
    component
        .tasks
        .push(tokio::spawn(async move { elector.run(elector_rx).await }));
    component
        .tasks
        .push(tokio::spawn(async move { converger.run(rx).await }));
    Ok(component)
}
