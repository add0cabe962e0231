//! Loading desired workloads from a JSON file at startup.

use std::path::Path;

use anyhow::Context;
use cellgrid_state::{DesiredLrp, DesiredWorkload, StateError, StateStore, Task};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DesiredFile {
    #[serde(default)]
    pub lrps: Vec<DesiredLrp>,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl DesiredFile {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }
}

/// Create every workload in `file`, skipping ones that already exist.
/// Returns how many were created.
pub fn seed_desired(store: &StateStore, file: DesiredFile) -> anyhow::Result<usize> {
    let workloads = file
        .lrps
        .into_iter()
        .map(DesiredWorkload::Lrp)
        .chain(file.tasks.into_iter().map(DesiredWorkload::Task));

    let mut created = 0;
    for workload in workloads {
        let guid = workload.guid().to_string();
        match store.create_desired(&workload) {
            Ok(_) => {
                info!(%guid, "desired workload created");
                created += 1;
            }
            Err(StateError::AlreadyExists(_)) => info!(%guid, "desired workload already present"),
            Err(e) => return Err(e).with_context(|| format!("failed to create {guid}")),
        }
    }
    Ok(created)
}
