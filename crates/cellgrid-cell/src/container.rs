//! Container runtime.
//!
//! A container here is a sandbox directory plus the limits every process
//! started in it runs under. [`ProcessRuntime`] runs each script as
//! `sh -c` in its own process group with:
//!
//! - `RLIMIT_NOFILE` set to the file-descriptor quota
//! - `RLIMIT_FSIZE` set to the disk quota
//! - a watchdog that kills the group once its resident memory exceeds the
//!   memory quota
//!
//! Dropping a running [`ContainerRuntime::run`] future kills the whole
//! process group, which is how timeouts and stop orders take effect.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cellgrid_state::{LogConfig, ResourceRequest};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::CellResult;
use crate::logs::{LogMessage, LogSink, LogStream};

/// What to create.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Instance or task GUID.
    pub id: String,
    pub resources: ResourceRequest,
    pub log: LogConfig,
}

/// A created container.
#[derive(Debug, Clone)]
pub struct Container {
    pub spec: ContainerSpec,
    pub sandbox: PathBuf,
}

/// How a script ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Exit code, or 128 + signal number when killed by a signal.
    Exited(i32),
    /// Killed by the memory watchdog.
    OutOfMemory,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> CellResult<Container>;

    async fn run(
        &self,
        container: &Container,
        script: &str,
        env: &[(String, String)],
    ) -> CellResult<RunOutcome>;

    async fn destroy(&self, container: &Container) -> CellResult<()>;
}

/// Runs containers as local process groups under a root directory.
pub struct ProcessRuntime {
    root: PathBuf,
    sink: Arc<dyn LogSink>,
    memory_poll: Duration,
}

impl ProcessRuntime {
    pub fn new(root: impl Into<PathBuf>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            root: root.into(),
            sink,
            memory_poll: Duration::from_millis(50),
        }
    }

    /// How often the memory watchdog samples the process group.
    pub fn with_memory_poll(mut self, interval: Duration) -> Self {
        self.memory_poll = interval;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ContainerRuntime for ProcessRuntime {
    async fn create(&self, spec: &ContainerSpec) -> CellResult<Container> {
        let sandbox = self.root.join(&spec.id);
        tokio::fs::create_dir_all(&sandbox).await?;
        debug!(container = %spec.id, sandbox = ?sandbox, "container created");
        Ok(Container {
            spec: spec.clone(),
            sandbox,
        })
    }

    async fn run(
        &self,
        container: &Container,
        script: &str,
        env: &[(String, String)],
    ) -> CellResult<RunOutcome> {
        let limits = container.spec.resources;
        let nofile = limits.file_descriptors as libc::rlim_t;
        let fsize = limits.disk_mb.saturating_mul(1024 * 1024) as libc::rlim_t;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(script)
            .current_dir(&container.sandbox)
            .env_clear()
            .env("PATH", host_path())
            .env("HOME", &container.sandbox)
            .env("TMPDIR", &container.sandbox)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                if libc::setrlimit(libc::RLIMIT_NOFILE, &rlimit(nofile)) != 0
                    || libc::setrlimit(libc::RLIMIT_FSIZE, &rlimit(fsize)) != 0
                {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn()?;
        let mut group = GroupGuard(child.id().map(|pid| pid as i32));

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(stdout, LogStream::Out, container, self.sink.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(stderr, LogStream::Err, container, self.sink.clone()));
        }

        let memory_limit = limits.memory_mb.saturating_mul(1024 * 1024);
        let pgid = group.0;
        let poll = self.memory_poll;
        let watchdog = async move {
            let Some(pgid) = pgid else {
                return std::future::pending::<()>().await;
            };
            loop {
                tokio::time::sleep(poll).await;
                let rss = group_rss_bytes(pgid);
                if rss > memory_limit {
                    warn!(pgid, rss, limit = memory_limit, "container exceeded memory limit");
                    return;
                }
            }
        };

        let outcome = tokio::select! {
            status = child.wait() => {
                let status = status?;
                RunOutcome::Exited(
                    status
                        .code()
                        .or_else(|| status.signal().map(|sig| 128 + sig))
                        .unwrap_or(-1),
                )
            }
            _ = watchdog => {
                group.kill();
                let _ = child.wait().await;
                RunOutcome::OutOfMemory
            }
        };

        // Leftover background processes would keep the pipes open.
        group.kill();
        for reader in readers {
            let _ = reader.await;
        }
        debug!(container = %container.spec.id, ?outcome, "script finished");
        Ok(outcome)
    }

    async fn destroy(&self, container: &Container) -> CellResult<()> {
        match tokio::fs::remove_dir_all(&container.sandbox).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(container = %container.spec.id, "container destroyed");
        Ok(())
    }
}

/// Kills a process group when dropped.
struct GroupGuard(Option<i32>);

impl GroupGuard {
    fn kill(&mut self) {
        if let Some(pgid) = self.0.take() {
            // SAFETY: plain syscall; a stale group ID yields ESRCH.
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

fn rlimit(value: libc::rlim_t) -> libc::rlimit {
    libc::rlimit {
        rlim_cur: value,
        rlim_max: value,
    }
}

fn host_path() -> String {
    std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string())
}

fn forward_lines<R>(
    reader: R,
    stream: LogStream,
    container: &Container,
    sink: Arc<dyn LogSink>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let guid = container.spec.log.guid.clone();
    let source_name = container.spec.log.source_name.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink.emit(LogMessage {
                guid: guid.clone(),
                source_name: source_name.clone(),
                stream,
                line,
            });
        }
    })
}

/// Resident memory of every live process in group `pgid`, from /proc.
fn group_rss_bytes(pgid: i32) -> u64 {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter(|pid| process_group_of(*pid) == Some(pgid))
        .map(rss_bytes)
        .sum()
}

fn process_group_of(pid: u32) -> Option<i32> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name may contain spaces; fields resume after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(2)?.parse().ok()
}

fn rss_bytes(pid: u32) -> u64 {
    let Ok(status) = std::fs::read_to_string(format!("/proc/{pid}/status")) else {
        return 0;
    };
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|kb| kb.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}
