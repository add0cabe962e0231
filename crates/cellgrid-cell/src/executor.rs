//! Step execution inside a container.
//!
//! Steps run strictly in order and the first failure ends the sequence;
//! nothing after a failed or timed-out step runs. Failure reasons are
//! human-readable strings recorded on the task or instance.

use std::sync::Arc;
use std::time::Duration;

use cellgrid_state::{Action, Step};
use tracing::debug;

use crate::container::{Container, ContainerRuntime, RunOutcome};
use crate::env::expand_env;
use crate::transfer::{Transfer, fetch_result, sandbox_path};

/// Result of a step sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Every step succeeded; carries the last fetched result, if any.
    Succeeded { result: Option<String> },
    Failed { reason: String },
}

impl Completion {
    pub fn into_result(self) -> Result<Option<String>, String> {
        match self {
            Completion::Succeeded { result } => Ok(result),
            Completion::Failed { reason } => Err(reason),
        }
    }
}

/// Reason recorded for a script killed by the memory watchdog.
pub const OUT_OF_MEMORY_REASON: &str = "Exited with status 137 (out of memory)";

#[derive(Clone)]
pub struct Executor {
    runtime: Arc<dyn ContainerRuntime>,
    transfer: Transfer,
}

impl Executor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            transfer: Transfer::default(),
        }
    }

    pub fn with_transfer(mut self, transfer: Transfer) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Run `steps` in order, stopping at the first failure.
    pub async fn run_steps(
        &self,
        container: &Container,
        steps: &[Step],
        base_env: &[(String, String)],
    ) -> Completion {
        let mut result = None;
        for (i, step) in steps.iter().enumerate() {
            match self.run_step(container, step, base_env).await {
                Ok(Some(fetched)) => result = Some(fetched),
                Ok(None) => {}
                Err(reason) => {
                    debug!(container = %container.spec.id, step = i, %reason, "step failed");
                    return Completion::Failed { reason };
                }
            }
        }
        Completion::Succeeded { result }
    }

    /// Run one step under its timeout. `Ok` carries fetched result content.
    pub async fn run_step(
        &self,
        container: &Container,
        step: &Step,
        base_env: &[(String, String)],
    ) -> Result<Option<String>, String> {
        let action = self.run_action(container, &step.action, base_env);
        match step.timeout_ms.map(Duration::from_millis) {
            Some(limit) => tokio::time::timeout(limit, action)
                .await
                .unwrap_or_else(|_| Err(format!("Timed out after {limit:?}"))),
            None => action.await,
        }
    }

    async fn run_action(
        &self,
        container: &Container,
        action: &Action,
        base_env: &[(String, String)],
    ) -> Result<Option<String>, String> {
        match action {
            Action::Run { script, env } => {
                let env = expand_env(base_env, env);
                match self.runtime.run(container, script, &env).await {
                    Ok(RunOutcome::Exited(0)) => Ok(None),
                    Ok(RunOutcome::Exited(code)) => Err(format!("Exited with status {code}")),
                    Ok(RunOutcome::OutOfMemory) => Err(OUT_OF_MEMORY_REASON.to_string()),
                    Err(e) => Err(format!("Failed to run: {e}")),
                }
            }
            Action::Download { from, to, extract } => {
                let dest = sandbox_path(&container.sandbox, to)
                    .map_err(|e| format!("Download failed: {e}"))?;
                let max = container.spec.resources.disk_mb.saturating_mul(1024 * 1024);
                self.transfer
                    .download(from, &dest, *extract, max)
                    .await
                    .map(|_| None)
                    .map_err(|e| format!("Download failed: {e}"))
            }
            Action::Upload { from, to } => {
                let src = sandbox_path(&container.sandbox, from)
                    .map_err(|e| format!("Upload failed: {e}"))?;
                self.transfer
                    .upload(&src, to)
                    .await
                    .map(|_| None)
                    .map_err(|e| format!("Upload failed: {e}"))
            }
            Action::FetchResult { file } => sandbox_path(&container.sandbox, file)
                .and_then(|path| fetch_result(&path))
                .map(Some)
                .map_err(|e| format!("Fetch result failed: {e}")),
        }
    }
}
