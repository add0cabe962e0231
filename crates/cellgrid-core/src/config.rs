//! cellgrid.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CellgridConfig {
    pub store: Option<StoreConfig>,
    pub cell: Option<CellSection>,
    pub auctioneer: Option<AuctioneerSection>,
    pub converger: Option<ConvergerSection>,
    pub lock: Option<LockSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the state database.
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CellSection {
    pub id: Option<String>,
    pub stack: Option<String>,
    pub memory_mb: Option<i64>,
    pub disk_mb: Option<i64>,
    pub file_descriptors: Option<u64>,
    pub max_containers: Option<u32>,
    pub heartbeat_interval: Option<String>,
    /// Root directory for container sandboxes.
    pub work_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuctioneerSection {
    pub interval: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConvergerSection {
    pub interval: Option<String>,
    pub cell_ttl: Option<String>,
    pub task_retention: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockSection {
    pub ttl: Option<String>,
}

/// Resolved timings with defaults filled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub heartbeat_interval: Duration,
    pub cell_ttl: Duration,
    pub auctioneer_interval: Duration,
    pub converger_interval: Duration,
    pub lease_ttl: Duration,
    pub task_retention: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            cell_ttl: Duration::from_secs(5),
            auctioneer_interval: Duration::from_millis(500),
            converger_interval: Duration::from_secs(1),
            lease_ttl: Duration::from_secs(10),
            task_retention: Duration::from_secs(120),
        }
    }
}

impl CellgridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: CellgridConfig =
            toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Timings from the file, falling back to [`Settings::default`].
    pub fn settings(&self) -> anyhow::Result<Settings> {
        let defaults = Settings::default();
        let cell = self.cell.clone().unwrap_or_default();
        let auctioneer = self.auctioneer.clone().unwrap_or_default();
        let converger = self.converger.clone().unwrap_or_default();
        let lock = self.lock.clone().unwrap_or_default();

        let settings = Settings {
            heartbeat_interval: resolve(
                "cell.heartbeat_interval",
                &cell.heartbeat_interval,
                defaults.heartbeat_interval,
            )?,
            cell_ttl: resolve("converger.cell_ttl", &converger.cell_ttl, defaults.cell_ttl)?,
            auctioneer_interval: resolve(
                "auctioneer.interval",
                &auctioneer.interval,
                defaults.auctioneer_interval,
            )?,
            converger_interval: resolve(
                "converger.interval",
                &converger.interval,
                defaults.converger_interval,
            )?,
            lease_ttl: resolve("lock.ttl", &lock.ttl, defaults.lease_ttl)?,
            task_retention: resolve(
                "converger.task_retention",
                &converger.task_retention,
                defaults.task_retention,
            )?,
        };
        if settings.cell_ttl <= settings.heartbeat_interval {
            return Err(anyhow!(
                "converger.cell_ttl ({:?}) must exceed cell.heartbeat_interval ({:?})",
                settings.cell_ttl,
                settings.heartbeat_interval
            ));
        }
        Ok(settings)
    }
}

fn resolve(key: &str, value: &Option<String>, default: Duration) -> anyhow::Result<Duration> {
    match value {
        None => Ok(default),
        Some(raw) => match parse_duration(raw) {
            Some(d) if !d.is_zero() => Ok(d),
            _ => Err(anyhow!("{key}: invalid duration {raw:?}")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: CellgridConfig = toml::from_str("").unwrap();
        assert_eq!(config.settings().unwrap(), Settings::default());
    }

    #[test]
    fn sections_override_defaults() {
        let config: CellgridConfig = toml::from_str(
            r#"
            [store]
            data_dir = "/var/lib/cellgrid"

            [cell]
            id = "cell-z1"
            stack = "linux"
            memory_mb = 4096
            disk_mb = 8192
            file_descriptors = 65536
            heartbeat_interval = "200ms"

            [auctioneer]
            interval = "250ms"

            [converger]
            interval = "2s"
            cell_ttl = "3s"
            task_retention = "5m"

            [lock]
            ttl = "15s"
            "#,
        )
        .unwrap();

        let cell = config.cell.clone().unwrap();
        assert_eq!(cell.id.as_deref(), Some("cell-z1"));
        assert_eq!(cell.memory_mb, Some(4096));
        assert_eq!(cell.file_descriptors, Some(65536));
        assert_eq!(
            config.store.clone().unwrap().data_dir,
            Some(PathBuf::from("/var/lib/cellgrid"))
        );

        let settings = config.settings().unwrap();
        assert_eq!(settings.heartbeat_interval, Duration::from_millis(200));
        assert_eq!(settings.auctioneer_interval, Duration::from_millis(250));
        assert_eq!(settings.converger_interval, Duration::from_secs(2));
        assert_eq!(settings.cell_ttl, Duration::from_secs(3));
        assert_eq!(settings.task_retention, Duration::from_secs(300));
        assert_eq!(settings.lease_ttl, Duration::from_secs(15));
    }

    #[test]
    fn bad_durations_name_the_key() {
        let config: CellgridConfig = toml::from_str("[lock]\nttl = \"forever\"").unwrap();
        let err = config.settings().unwrap_err().to_string();
        assert!(err.contains("lock.ttl"), "{err}");

        let config: CellgridConfig = toml::from_str("[auctioneer]\ninterval = \"0s\"").unwrap();
        assert!(config.settings().is_err());
    }

    #[test]
    fn ttl_must_outlast_heartbeat() {
        let config: CellgridConfig = toml::from_str(
            "[cell]\nheartbeat_interval = \"5s\"\n[converger]\ncell_ttl = \"5s\"",
        )
        .unwrap();
        assert!(config.settings().is_err());
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cellgrid.toml");
        std::fs::write(&path, "[cell]\nstack = \"linux\"\n").unwrap();
        let config = CellgridConfig::from_file(&path).unwrap();
        assert_eq!(config.cell.unwrap().stack.as_deref(), Some("linux"));

        assert!(CellgridConfig::from_file(&dir.path().join("missing.toml")).is_err());
    }
}
