//! Host process enumeration and signalling.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::{Pid, getpgid};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{HostError, HostResult};

/// A process running on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub cmdline: Vec<String>,
}

#[async_trait]
pub trait HostProcesses: Send + Sync {
    async fn list(&self) -> HostResult<Vec<ProcessInfo>>;

    /// SIGKILL the whole process group of `pid`. A vanished process is not an error.
    async fn kill_group(&self, pid: u32) -> HostResult<()>;

    /// Stop the process recorded in `pidfile`: SIGTERM its group, then SIGKILL
    /// after `grace`. Returns once the process is gone. A missing pidfile means
    /// there is nothing to stop.
    async fn terminate(&self, pidfile: &Path, grace: Duration) -> HostResult<()>;
}

/// Real host processes via `sysinfo` and `nix`.
#[derive(Debug, Default, Clone)]
pub struct SystemProcesses;

impl SystemProcesses {
    pub fn new() -> Self {
        Self
    }
}

fn signal_group(pid: u32, sig: Signal) -> HostResult<bool> {
    let target = Pid::from_raw(pid as i32);
    let group = match getpgid(Some(target)) {
        Ok(group) => group,
        Err(Errno::ESRCH) => return Ok(false),
        Err(source) => return Err(HostError::Signal { pid, source }),
    };
    match signal::killpg(group, sig) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(source) => Err(HostError::Signal { pid, source }),
    }
}

fn is_alive(pid: u32) -> bool {
    !matches!(signal::kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH))
}

#[async_trait]
impl HostProcesses for SystemProcesses {
    async fn list(&self) -> HostResult<Vec<ProcessInfo>> {
        tokio::task::spawn_blocking(|| {
            let mut system = System::new();
            system.refresh_processes_specifics(
                ProcessesToUpdate::All,
                true,
                ProcessRefreshKind::new().with_cmd(UpdateKind::Always),
            );
            system
                .processes()
                .iter()
                .map(|(pid, process)| ProcessInfo {
                    pid: pid.as_u32(),
                    cmdline: process
                        .cmd()
                        .iter()
                        .map(|arg| arg.to_string_lossy().into_owned())
                        .collect(),
                })
                .collect()
        })
        .await
        .map_err(|e| HostError::Listing(e.to_string()))
    }

    async fn kill_group(&self, pid: u32) -> HostResult<()> {
        if signal_group(pid, Signal::SIGKILL)? {
            debug!(pid, "sent SIGKILL to process group");
        } else {
            debug!(pid, "process already gone");
        }
        Ok(())
    }

    async fn terminate(&self, pidfile: &Path, grace: Duration) -> HostResult<()> {
        let contents = match tokio::fs::read_to_string(pidfile).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(pidfile = %pidfile.display(), "no pidfile, nothing to terminate");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let Ok(pid) = contents.trim().parse::<u32>() else {
            warn!(pidfile = %pidfile.display(), "pidfile does not contain a pid");
            let _ = tokio::fs::remove_file(pidfile).await;
            return Ok(());
        };

        if signal_group(pid, Signal::SIGTERM)? {
            let deadline = Instant::now() + grace;
            while is_alive(pid) && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            if is_alive(pid) {
                warn!(pid, "process ignored SIGTERM, killing group");
                signal_group(pid, Signal::SIGKILL)?;
                let deadline = Instant::now() + Duration::from_secs(5);
                while is_alive(pid) && Instant::now() < deadline {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }

        if let Err(e) = tokio::fs::remove_file(pidfile).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            return Err(e.into());
        }
        debug!(pid, "process terminated");
        Ok(())
    }
}
