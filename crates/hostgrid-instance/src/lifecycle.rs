//! Watch start and teardown sequences shared by instances and API servers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use hostgrid_core::{Outcome, RetryPolicy};
use hostgrid_supervisor::{ProcessSupervisor, SupervisorError, WatchSpec};

use crate::error::OrchestratorResult;
use crate::host::HostProcesses;

/// Supervisor plus host access, with the timing knobs every watch needs.
#[derive(Clone)]
pub(crate) struct WatchControl {
    pub supervisor: Arc<dyn ProcessSupervisor>,
    pub host: Arc<dyn HostProcesses>,
    pub retry: RetryPolicy,
    /// Pause between reload and start so the supervisor has read the new config.
    pub settle: Duration,
    pub stop_grace: Duration,
    pub pid_dir: PathBuf,
}

impl WatchControl {
    pub fn pidfile(&self, watch: &str) -> PathBuf {
        self.pid_dir.join(format!("{watch}.pid"))
    }

    pub async fn reload(&self) -> OrchestratorResult<()> {
        self.retry
            .run("supervisor reload", || self.supervisor.reload())
            .await?;
        Ok(())
    }

    /// Write the watch, reload, and start it.
    pub async fn start_watch(&self, spec: &WatchSpec) -> OrchestratorResult<()> {
        self.supervisor.create_watch(spec).await?;
        self.reload().await?;
        tokio::time::sleep(self.settle).await;

        let outcome = self
            .retry
            .run("supervisor start", || self.supervisor.start(&spec.name))
            .await?;
        if outcome == Outcome::AlreadyAbsent {
            return Err(SupervisorError::Unavailable(format!(
                "{} missing after reload",
                spec.name
            ))
            .into());
        }
        debug!(watch = %spec.name, "watch started");
        Ok(())
    }

    /// Unmonitor the watch, drop its config and wait for the process to exit.
    ///
    /// An unknown watch is already stopped; its config is still removed in
    /// case the file outlived the supervisor's memory of it.
    pub async fn unmonitor_and_terminate(&self, watch: &str) -> OrchestratorResult<Outcome> {
        let outcome = self
            .retry
            .run("supervisor unmonitor", || self.supervisor.unmonitor(watch))
            .await?;
        if outcome == Outcome::AlreadyAbsent {
            info!(%watch, "supervisor does not know watch, treating as stopped");
        }

        self.supervisor.remove_watch_config(watch).await?;
        self.host
            .terminate(&self.pidfile(watch), self.stop_grace)
            .await?;
        Ok(outcome)
    }
}
