//! The cell agent, one per cell.
//!
//! Publishes the cell's presence record, picks up work orders addressed
//! to the cell, reserves capacity for them, runs them in containers and
//! mirrors every state change to the store with conditional writes.
//!
//! Containers run as tasks owned by [`CellAgent::run`]. Aborting that
//! future kills every container without touching the store, which is
//! exactly what a crashed cell looks like to the rest of the system.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cellgrid_state::{
    ActualInstance, ActualState, Capacity, CellRecord, DesiredLrp, Expected, Placement, StateError,
    StateStore, Step, Task, TaskState, Version, Versioned, Work, WorkOrder, epoch_millis,
};
use tokio::sync::{Mutex, Notify, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::capacity::{CapacityLedger, Reservation};
use crate::container::{Container, ContainerSpec};
use crate::error::{CellError, CellResult};
use crate::executor::{Completion, Executor};

/// Configuration for a cell agent.
#[derive(Debug, Clone)]
pub struct CellConfig {
    pub cell_id: String,
    pub stack: String,
    /// Signed so that nonsense from the command line can be rejected.
    pub memory_mb: i64,
    pub disk_mb: i64,
    /// Total file descriptors shared by all containers.
    pub file_descriptors: u64,
    pub max_containers: u32,
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    /// How long a graceful shutdown waits for containers to stop.
    pub shutdown_grace: Duration,
}

impl CellConfig {
    pub fn new(cell_id: impl Into<String>, stack: impl Into<String>, memory_mb: i64, disk_mb: i64) -> Self {
        Self {
            cell_id: cell_id.into(),
            stack: stack.into(),
            memory_mb,
            disk_mb,
            file_descriptors: 256 * 1024,
            max_containers: 256,
            heartbeat_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    /// Check the configuration and return the cell's total capacity.
    pub fn validate(&self) -> CellResult<Capacity> {
        if self.memory_mb <= 0 || self.disk_mb <= 0 {
            return Err(CellError::Config(
                "valid memory and disk capacity must be specified".to_string(),
            ));
        }
        if self.cell_id.is_empty() || self.cell_id.contains('/') {
            return Err(CellError::Config(format!("invalid cell id {:?}", self.cell_id)));
        }
        if self.stack.is_empty() {
            return Err(CellError::Config("stack must be specified".to_string()));
        }
        if self.max_containers == 0 {
            return Err(CellError::Config("max_containers must be positive".to_string()));
        }
        if self.file_descriptors == 0 {
            return Err(CellError::Config("file_descriptors must be positive".to_string()));
        }
        Ok(Capacity::new(
            self.memory_mb as u64,
            self.disk_mb as u64,
            self.file_descriptors,
            self.max_containers,
        ))
    }
}

/// A container this agent is running, by work key.
struct Running {
    /// Set for LRP instances.
    instance_guid: Option<String>,
    stop: oneshot::Sender<()>,
}

struct Inner {
    config: CellConfig,
    store: StateStore,
    executor: Executor,
    ledger: Mutex<CapacityLedger>,
    running: Mutex<HashMap<String, Running>>,
    /// Signalled whenever reservations change so the cell record is
    /// republished without waiting for the next heartbeat.
    wake: Notify,
}

/// How an LRP container ended.
enum LrpEnd {
    Crashed(String),
    Stopped,
    /// Our actual record vanished or changed under us.
    Lost,
}

#[derive(Clone)]
pub struct CellAgent {
    inner: Arc<Inner>,
}

impl CellAgent {
    pub fn new(config: CellConfig, store: StateStore, executor: Executor) -> CellResult<Self> {
        let total = config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                executor,
                ledger: Mutex::new(CapacityLedger::new(total)),
                running: Mutex::new(HashMap::new()),
                wake: Notify::new(),
            }),
        })
    }

    pub fn cell_id(&self) -> &str {
        &self.inner.config.cell_id
    }

    pub async fn available(&self) -> Capacity {
        self.inner.ledger.lock().await.available()
    }

    /// Number of containers currently running.
    pub async fn running_count(&self) -> usize {
        self.inner.running.lock().await.len()
    }

    // ── Presence ───────────────────────────────────────────────────

    /// Publish the cell record with current availability.
    pub async fn heartbeat(&self) -> CellResult<()> {
        let (total, available) = {
            let ledger = self.inner.ledger.lock().await;
            (ledger.total(), ledger.available())
        };
        let record = CellRecord {
            cell_id: self.inner.config.cell_id.clone(),
            stack: self.inner.config.stack.clone(),
            total,
            available,
            heartbeat_at: epoch_millis(),
        };
        self.inner.store.put_cell(&record)?;
        debug!(cell_id = %record.cell_id, ?available, "heartbeat published");
        Ok(())
    }

    /// Clear records left by a previous incarnation of this cell.
    ///
    /// A fresh agent hosts nothing, so any actual instance naming this cell
    /// is gone and any task running here will never finish.
    pub async fn cleanup_stale(&self) -> CellResult<()> {
        let cell_id = self.cell_id();
        let store = &self.inner.store;
        for actual in store.list_actual()? {
            if actual.value.cell_id != cell_id {
                continue;
            }
            match store.remove_actual(&actual.value.process_guid, actual.value.index, actual.version) {
                Ok(()) => info!(
                    %cell_id,
                    process_guid = %actual.value.process_guid,
                    index = actual.value.index,
                    "removed stale actual instance"
                ),
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e.into()),
            }
        }
        for task in store.list_tasks()? {
            if task.value.state != TaskState::Running || task.value.cell_id.as_deref() != Some(cell_id) {
                continue;
            }
            let failed = task
                .value
                .clone()
                .completed(Err("cell restarted before task completed".to_string()), epoch_millis());
            match store.compare_and_swap_task(&task.value.task_guid, task.version, &failed) {
                Ok(_) => info!(%cell_id, task_guid = %task.value.task_guid, "failed orphaned task"),
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    // ── Main loop ──────────────────────────────────────────────────

    /// Run until shutdown, then stop every container and withdraw the
    /// cell record.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> CellResult<()> {
        let cell_id = self.cell_id().to_string();
        self.cleanup_stale().await?;
        self.heartbeat().await?;
        info!(%cell_id, stack = %self.inner.config.stack, "cell agent started");

        let mut containers = JoinSet::new();
        let mut heartbeat = tokio::time::interval(self.inner.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut poll = tokio::time::interval(self.inner.config.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        warn!(%cell_id, error = %e, "heartbeat failed");
                    }
                    if let Err(e) = self.reconcile_running().await {
                        warn!(%cell_id, error = %e, "reconcile failed");
                    }
                }
                _ = self.inner.wake.notified() => {
                    if let Err(e) = self.heartbeat().await {
                        warn!(%cell_id, error = %e, "heartbeat failed");
                    }
                }
                _ = poll.tick() => {
                    if let Err(e) = self.poll_orders(&mut containers).await {
                        warn!(%cell_id, error = %e, "order poll failed");
                    }
                }
                Some(joined) = containers.join_next() => {
                    if let Err(e) = joined
                        && e.is_panic()
                    {
                        warn!(%cell_id, error = %e, "container task panicked");
                    }
                }
                _ = shutdown.changed() => {
                    info!(%cell_id, "cell agent shutting down");
                    break;
                }
            }
        }

        self.drain(containers).await;
        Ok(())
    }

    async fn drain(&self, mut containers: JoinSet<()>) {
        let cell_id = self.cell_id();
        let stops: Vec<_> = self
            .inner
            .running
            .lock()
            .await
            .drain()
            .map(|(_, running)| running.stop)
            .collect();
        for stop in stops {
            let _ = stop.send(());
        }

        let drained = tokio::time::timeout(self.inner.config.shutdown_grace, async {
            while containers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(%cell_id, "containers did not stop in time, aborting");
            containers.shutdown().await;
        }

        match self.inner.store.get_cell(cell_id) {
            Ok(Some(record)) => {
                if let Err(e) = self.inner.store.remove_cell(cell_id, record.version) {
                    warn!(%cell_id, error = %e, "failed to withdraw cell record");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(%cell_id, error = %e, "failed to read cell record"),
        }
        info!(%cell_id, "cell agent stopped");
    }

    // ── Orders ─────────────────────────────────────────────────────

    /// Handle every order currently addressed to this cell.
    pub async fn poll_orders(&self, containers: &mut JoinSet<()>) -> CellResult<()> {
        let orders = self.inner.store.list_orders_for_cell(self.cell_id())?;
        for order in orders {
            match order.value.work.clone() {
                Work::Start(Placement::Lrp {
                    process_guid,
                    index,
                }) => self.accept_lrp(&order, &process_guid, index, containers).await?,
                Work::Start(Placement::Task { task_guid }) => {
                    self.accept_task(&order, &task_guid, containers).await?
                }
                Work::Stop {
                    process_guid,
                    index,
                    instance_guid,
                } => self.stop_instance(&order, &process_guid, index, &instance_guid).await?,
            }
        }
        Ok(())
    }

    /// Remove a consumed or stale order.
    fn discard(&self, order: &Versioned<WorkOrder>) {
        let key = order.value.work.work_key();
        match self
            .inner
            .store
            .remove_order(&order.value.cell_id, &key, order.version)
        {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {}
            Err(e) => warn!(cell_id = %order.value.cell_id, %key, error = %e, "failed to remove order"),
        }
    }

    /// Remove an order whose work is now ours. The cell record is
    /// republished first so the auctioneer never sees the order gone while
    /// the capacity still looks free.
    async fn consume(&self, order: &Versioned<WorkOrder>) {
        if let Err(e) = self.heartbeat().await {
            warn!(cell_id = %self.cell_id(), error = %e, "heartbeat failed");
        }
        self.discard(order);
    }

    /// Hand an order back to the auctioneer.
    fn reject(&self, order: &Versioned<WorkOrder>, target: &Placement, why: &str) -> CellResult<()> {
        info!(cell_id = %self.cell_id(), key = %target.work_key(), reason = why, "order rejected");
        self.discard(order);
        self.inner.store.request_auction(target)?;
        Ok(())
    }

    async fn reserve(&self, key: &str, req: &cellgrid_state::ResourceRequest) -> Reservation {
        let outcome = self.inner.ledger.lock().await.try_reserve(key, req);
        if outcome == Reservation::Reserved {
            self.inner.wake.notify_one();
        }
        outcome
    }

    async fn finish(&self, key: &str) {
        self.inner.running.lock().await.remove(key);
        self.inner.ledger.lock().await.release(key);
        self.inner.wake.notify_one();
    }

    async fn accept_lrp(
        &self,
        order: &Versioned<WorkOrder>,
        process_guid: &str,
        index: u32,
        containers: &mut JoinSet<()>,
    ) -> CellResult<()> {
        let target = Placement::lrp(process_guid, index);
        let key = target.work_key();
        let Some(desired) = self.inner.store.get_desired_lrp(process_guid)? else {
            self.discard(order);
            return Ok(());
        };
        let lrp = desired.value;
        if index >= lrp.instances || lrp.actions.is_empty() {
            self.discard(order);
            return Ok(());
        }
        if lrp.stack != self.inner.config.stack {
            return self.reject(order, &target, "stack mismatch");
        }
        match self.reserve(&key, &lrp.resources).await {
            Reservation::Reserved => {}
            Reservation::AlreadyHeld => {
                self.discard(order);
                return Ok(());
            }
            Reservation::Insufficient => return self.reject(order, &target, "insufficient capacity"),
        }

        let instance = ActualInstance {
            process_guid: process_guid.to_string(),
            index,
            instance_guid: uuid::Uuid::new_v4().to_string(),
            cell_id: self.cell_id().to_string(),
            state: ActualState::Starting,
            crash_reason: None,
            since: epoch_millis(),
        };
        let version = match self.inner.store.upsert_actual(&instance, Expected::Absent) {
            Ok(version) => version,
            Err(e) => {
                self.finish(&key).await;
                self.discard(order);
                if e.is_conflict() {
                    debug!(%key, "slot already occupied");
                    return Ok(());
                }
                return Err(e.into());
            }
        };
        self.consume(order).await;
        info!(
            cell_id = %self.cell_id(),
            %process_guid,
            index,
            instance_guid = %instance.instance_guid,
            "starting instance"
        );

        let (stop, stopped) = oneshot::channel();
        self.inner.running.lock().await.insert(
            key.clone(),
            Running {
                instance_guid: Some(instance.instance_guid.clone()),
                stop,
            },
        );
        let agent = self.clone();
        containers.spawn(async move { agent.run_lrp(key, lrp, instance, version, stopped).await });
        Ok(())
    }

    async fn accept_task(
        &self,
        order: &Versioned<WorkOrder>,
        task_guid: &str,
        containers: &mut JoinSet<()>,
    ) -> CellResult<()> {
        let target = Placement::task(task_guid);
        let key = target.work_key();
        let Some(task) = self.inner.store.get_task(task_guid)? else {
            self.discard(order);
            return Ok(());
        };
        if task.value.state != TaskState::Pending {
            self.discard(order);
            return Ok(());
        }
        if task.value.stack != self.inner.config.stack {
            return self.reject(order, &target, "stack mismatch");
        }
        match self.reserve(&key, &task.value.resources).await {
            Reservation::Reserved => {}
            Reservation::AlreadyHeld => {
                self.discard(order);
                return Ok(());
            }
            Reservation::Insufficient => return self.reject(order, &target, "insufficient capacity"),
        }

        let running = task.value.clone().started_on(self.cell_id(), epoch_millis());
        let version = match self
            .inner
            .store
            .compare_and_swap_task(task_guid, task.version, &running)
        {
            Ok(version) => version,
            Err(e) => {
                self.finish(&key).await;
                self.discard(order);
                if e.is_conflict() {
                    debug!(%key, "task claimed elsewhere");
                    return Ok(());
                }
                return Err(e.into());
            }
        };
        self.consume(order).await;
        info!(cell_id = %self.cell_id(), %task_guid, "starting task");

        let (stop, stopped) = oneshot::channel();
        self.inner.running.lock().await.insert(
            key.clone(),
            Running {
                instance_guid: None,
                stop,
            },
        );
        let agent = self.clone();
        containers.spawn(async move { agent.run_task(key, running, version, stopped).await });
        Ok(())
    }

    async fn stop_instance(
        &self,
        order: &Versioned<WorkOrder>,
        process_guid: &str,
        index: u32,
        instance_guid: &str,
    ) -> CellResult<()> {
        let key = Placement::lrp(process_guid, index).work_key();
        let stop = {
            let mut running = self.inner.running.lock().await;
            match running.get(&key) {
                Some(r) if r.instance_guid.as_deref() == Some(instance_guid) => {
                    running.remove(&key).map(|r| r.stop)
                }
                _ => None,
            }
        };

        match stop {
            Some(stop) => {
                info!(cell_id = %self.cell_id(), %process_guid, index, %instance_guid, "stopping instance");
                let _ = stop.send(());
            }
            None => {
                // Not running here; clear a leftover record that names us.
                if let Some(actual) = self.inner.store.get_actual(process_guid, index)?
                    && actual.value.cell_id == self.cell_id()
                    && actual.value.instance_guid == instance_guid
                {
                    match self.inner.store.remove_actual(process_guid, index, actual.version) {
                        Ok(()) => {}
                        Err(e) if e.is_conflict() => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        self.discard(order);
        Ok(())
    }

    /// Stop containers whose store records were removed or taken over.
    pub async fn reconcile_running(&self) -> CellResult<()> {
        let snapshot = self.inner.store.snapshot()?;
        let cell_id = self.cell_id();
        let mut running = self.inner.running.lock().await;
        let orphaned: Vec<String> = running
            .iter()
            .filter(|(key, r)| match &r.instance_guid {
                Some(guid) => !snapshot
                    .actual
                    .iter()
                    .any(|a| &a.value.instance_guid == guid && a.value.cell_id == cell_id),
                None => {
                    let task_guid = key.trim_start_matches("task/");
                    !snapshot.task(task_guid).is_some_and(|t| {
                        t.value.state == TaskState::Running && t.value.cell_id.as_deref() == Some(cell_id)
                    })
                }
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in orphaned {
            if let Some(r) = running.remove(&key) {
                warn!(%cell_id, %key, "store no longer expects this container, stopping it");
                let _ = r.stop.send(());
            }
        }
        Ok(())
    }

    // ── Containers ─────────────────────────────────────────────────

    fn base_env(&self, pairs: &[(&str, String)]) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        env.push(("CELL_ID".to_string(), self.cell_id().to_string()));
        env
    }

    async fn run_lrp(
        self,
        key: String,
        lrp: DesiredLrp,
        mut instance: ActualInstance,
        mut version: Version,
        mut stopped: oneshot::Receiver<()>,
    ) {
        let spec = ContainerSpec {
            id: instance.instance_guid.clone(),
            resources: lrp.resources,
            log: lrp.log.clone(),
        };
        let env = self.base_env(&[
            ("PROCESS_GUID", instance.process_guid.clone()),
            ("INSTANCE_INDEX", instance.index.to_string()),
            ("INSTANCE_GUID", instance.instance_guid.clone()),
        ]);

        let runtime = self.inner.executor.runtime().clone();
        let end = match runtime.create(&spec).await {
            Ok(container) => {
                let end = tokio::select! {
                    end = self.lrp_lifecycle(&container, &lrp.actions, &mut instance, &mut version, &env) => end,
                    _ = &mut stopped => LrpEnd::Stopped,
                };
                if let Err(e) = runtime.destroy(&container).await {
                    warn!(container = %spec.id, error = %e, "failed to destroy container");
                }
                end
            }
            Err(e) => LrpEnd::Crashed(format!("Failed to create container: {e}")),
        };

        let store = &self.inner.store;
        let written = match end {
            LrpEnd::Crashed(reason) => {
                info!(
                    process_guid = %instance.process_guid,
                    index = instance.index,
                    %reason,
                    "instance crashed"
                );
                instance.state = ActualState::Crashed;
                instance.crash_reason = Some(reason);
                instance.since = epoch_millis();
                store
                    .upsert_actual(&instance, Expected::Version(version))
                    .map(|_| ())
            }
            LrpEnd::Stopped => store.remove_actual(&instance.process_guid, instance.index, version),
            LrpEnd::Lost => Ok(()),
        };
        log_store_outcome(written, &key);
        self.finish(&key).await;
    }

    /// Setup steps, then mark running, then the long-running step.
    async fn lrp_lifecycle(
        &self,
        container: &Container,
        actions: &[Step],
        instance: &mut ActualInstance,
        version: &mut Version,
        env: &[(String, String)],
    ) -> LrpEnd {
        let Some((main, setup)) = actions.split_last() else {
            return LrpEnd::Crashed("no actions".to_string());
        };
        let executor = &self.inner.executor;
        if let Completion::Failed { reason } = executor.run_steps(container, setup, env).await {
            return LrpEnd::Crashed(reason);
        }

        instance.state = ActualState::Running;
        instance.since = epoch_millis();
        match self
            .inner
            .store
            .upsert_actual(instance, Expected::Version(*version))
        {
            Ok(v) => *version = v,
            Err(e) => {
                warn!(instance_guid = %instance.instance_guid, error = %e, "lost actual record");
                return LrpEnd::Lost;
            }
        }
        debug!(instance_guid = %instance.instance_guid, "instance running");

        match executor.run_step(container, main, env).await {
            Ok(_) => LrpEnd::Crashed("Exited with status 0".to_string()),
            Err(reason) => LrpEnd::Crashed(reason),
        }
    }

    async fn run_task(
        self,
        key: String,
        task: Task,
        version: Version,
        mut stopped: oneshot::Receiver<()>,
    ) {
        let spec = ContainerSpec {
            id: task.task_guid.clone(),
            resources: task.resources,
            log: task.log.clone(),
        };
        let env = self.base_env(&[("TASK_GUID", task.task_guid.clone())]);

        let runtime = self.inner.executor.runtime().clone();
        let completion = match runtime.create(&spec).await {
            Ok(container) => {
                let completion = tokio::select! {
                    completion = self.inner.executor.run_steps(&container, &task.actions, &env) => completion,
                    _ = &mut stopped => Completion::Failed {
                        reason: "task stopped before completion".to_string(),
                    },
                };
                if let Err(e) = runtime.destroy(&container).await {
                    warn!(container = %spec.id, error = %e, "failed to destroy container");
                }
                completion
            }
            Err(e) => Completion::Failed {
                reason: format!("Failed to create container: {e}"),
            },
        };

        let task_guid = task.task_guid.clone();
        let done = task.completed(completion.into_result(), epoch_millis());
        info!(%task_guid, failed = done.failed, reason = ?done.failure_reason, "task completed");
        let written = self
            .inner
            .store
            .compare_and_swap_task(&task_guid, version, &done)
            .map(|_| ());
        log_store_outcome(written, &key);
        self.finish(&key).await;
    }
}

fn log_store_outcome(result: Result<(), StateError>, key: &str) {
    match result {
        Ok(()) => {}
        Err(e) if e.is_conflict() => debug!(%key, error = %e, "record changed under us"),
        Err(e) => warn!(%key, error = %e, "failed to record container outcome"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_capacity() {
        for (memory, disk) in [(0, 1024), (1024, 0), (-1, 1024), (1024, -5)] {
            let err = CellConfig::new("cell-1", "linux", memory, disk)
                .validate()
                .unwrap_err();
            assert_eq!(err.to_string(), "valid memory and disk capacity must be specified");
        }
    }

    #[test]
    fn capacity_comes_from_config() {
        let mut config = CellConfig::new("cell-1", "linux", 2048, 4096);
        config.max_containers = 7;
        config.file_descriptors = 4096;
        assert_eq!(config.validate().unwrap(), Capacity::new(2048, 4096, 4096, 7));

        config.file_descriptors = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn cell_id_must_be_key_safe() {
        assert!(CellConfig::new("a/b", "linux", 1, 1).validate().is_err());
        assert!(CellConfig::new("", "linux", 1, 1).validate().is_err());
    }
}
