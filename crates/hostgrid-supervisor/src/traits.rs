//! Supervisor trait and watch definitions.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;

use hostgrid_core::Outcome;

use crate::error::SupervisorResult;

/// State of a watch as reported by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchState {
    Running,
    Stopped,
    Pending,
    /// Configured but not tracked; recovery treats these as garbage.
    Unmonitored,
}

impl WatchState {
    pub fn is_monitored(self) -> bool {
        self != WatchState::Unmonitored
    }
}

impl fmt::Display for WatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WatchState::Running => "running",
            WatchState::Stopped => "stopped",
            WatchState::Pending => "pending",
            WatchState::Unmonitored => "unmonitored",
        };
        f.write_str(s)
    }
}

/// Optional behavior attached to a watch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Restart the process when its port stops accepting connections.
    pub check_port: bool,
    /// Host used for the port check; defaults to localhost.
    pub check_host: Option<String>,
    /// Restart instead of merely alerting when the memory limit is exceeded.
    pub kill_exceeded_memory: bool,
    /// Supervisor group the watch belongs to.
    pub group: Option<String>,
    /// File that receives the process's stdout and stderr.
    pub log_file: Option<PathBuf>,
    /// Identifier prepended to log lines.
    pub log_tag: Option<String>,
}

/// Everything the supervisor needs to start and track one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSpec {
    pub name: String,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub pidfile: PathBuf,
    pub port: u16,
    pub max_memory_mb: Option<u64>,
    pub options: WatchOptions,
}

/// Control and query API of the external process supervisor.
///
/// `start`, `stop` and `unmonitor` report `Outcome::AlreadyAbsent` when the
/// supervisor has no such watch.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Write the watch configuration. Takes effect after `reload`.
    async fn create_watch(&self, spec: &WatchSpec) -> SupervisorResult<()>;

    async fn reload(&self) -> SupervisorResult<()>;

    async fn start(&self, name: &str) -> SupervisorResult<Outcome>;

    async fn stop(&self, name: &str) -> SupervisorResult<Outcome>;

    /// Stop tracking the watch without touching its configuration.
    async fn unmonitor(&self, name: &str) -> SupervisorResult<Outcome>;

    async fn list_watches(&self) -> SupervisorResult<BTreeMap<String, WatchState>>;

    /// Delete the watch configuration. A missing configuration is not an error.
    async fn remove_watch_config(&self, name: &str) -> SupervisorResult<()>;
}
